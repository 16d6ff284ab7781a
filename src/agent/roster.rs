//! Worker profiles and prompts

use crate::state::WorkerName;

pub const AGENT_NAME: &str = "Finnie";

/// Static description of one worker.
#[derive(Debug, Clone)]
pub struct WorkerProfile {
    pub name: WorkerName,
    pub system_prompt: String,
    /// Declare FINISH after the first plain answer, even on a fresh dispatch
    pub finish_on_first_answer: bool,
}

pub fn supervisor_prompt(workers: &[WorkerName]) -> String {
    let members = workers.iter().map(|w| w.as_str()).collect::<Vec<_>>().join(", ");
    format!(
        "You are the supervisor of {agent}, a personal finance assistant, managing these \
agents: {members}.\n\
Routing rules:\n\
- processing, saving or categorising bank statements and transactions -> Scribe\n\
- questions about spending or finances already stored -> Sage\n\
- everything else -> Fallback\n\
When the latest assistant message fully answers the user, reply FINISH.\n\
Reply with the single field \"next\": one of {members} or FINISH.",
        agent = AGENT_NAME,
        members = members,
    )
}

pub fn profile(name: WorkerName) -> WorkerProfile {
    match name {
        WorkerName::Scribe => WorkerProfile {
            name,
            system_prompt: format!(
                "You are Scribe, the statement-processing agent of {}. Use the tools to process \
the user's request, then stop. The usual pipeline is extract_all_texts, \
parse_all_statements, write_all_statements, read_transactions, classify_transactions, \
update_transaction_classification. Tools remember the references produced by earlier \
steps, so arguments can be omitted. When the work is done, reply with a short summary \
of what was processed. If a tool reports fatal_error, stop and explain.",
                AGENT_NAME
            ),
            finish_on_first_answer: false,
        },
        WorkerName::Sage => WorkerProfile {
            name,
            system_prompt: format!(
                "You are Sage, the insights agent of {}. Answer questions about the user's stored \
transactions using summarize_spending; use search_web for general financial facts. \
Be concise and quote amounts with two decimals.",
                AGENT_NAME
            ),
            finish_on_first_answer: false,
        },
        WorkerName::Fallback => WorkerProfile {
            name,
            system_prompt: format!(
                "You are {}, a personal finance assistant. The request is outside what you can do \
with the user's statements. Reply briefly and politely, and mention that you can \
process bank statements and answer questions about stored spending.",
                AGENT_NAME
            ),
            finish_on_first_answer: true,
        },
    }
}

/// Instruction appended for the closing turn of a failed task.
pub fn fatal_note(detail: &str) -> String {
    format!(
        "The current task has failed and cannot continue: {}\n\
No tools are available now. In a few sentences, tell the user what went wrong \
and what they could change, and say clearly that the step was not retried automatically.",
        detail.trim()
    )
}

/// Closing message used when the model's closing turn has no text.
pub fn fatal_closing_message(detail: &str) -> String {
    format!(
        "Sorry, I couldn't finish that request. {}\n\
The step was not retried automatically; fix the problem and ask again.",
        detail.trim()
    )
}
