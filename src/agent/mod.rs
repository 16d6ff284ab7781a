//! Main orchestrator - supervisor ⇄ worker graph walk
//!
//! SUPERVISOR → WORKER (loop until FINISH / fatal) → SUPERVISOR → ... → FINISH

pub mod roster;
pub mod supervisor;
pub mod worker;

use crate::config::Settings;
use crate::db::{self, StatementStore};
use crate::error::OrchestrationError;
use crate::llm::{ChatModel, GeminiChatModel};
use crate::memory::ReferenceStore;
use crate::search;
use crate::state::{RouteDirective, TaskState, WorkerName};
use crate::tools::{sage_registry, scribe_registry, ToolDeps, ToolRegistry};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

pub use roster::{profile, WorkerProfile, AGENT_NAME};
pub use supervisor::Supervisor;
pub use worker::{Worker, MAX_TOOL_ROUNDS};

/// Worker dispatches allowed per task
pub const MAX_SUPERVISOR_HOPS: usize = 8;

/// Lines starting with this are progress markers, not answer text.
pub const PROGRESS_PREFIX: &str = "::progress:: ";

/// Where workers announce progress. Disabled sinks drop everything.
#[derive(Clone, Default)]
pub struct ProgressSink {
    tx: Option<UnboundedSender<String>>,
}

impl ProgressSink {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, text: impl AsRef<str>) {
        if let Some(tx) = &self.tx {
            // receiver gone means nobody is rendering progress
            let _ = tx.send(format!("{}{}", PROGRESS_PREFIX, text.as_ref()));
        }
    }
}

/// One node decision in a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub node: String,
    pub decision: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

impl TraceEntry {
    pub fn new(node: &str, decision: impl Into<String>, tools: Vec<String>) -> Self {
        Self {
            node: node.to_string(),
            decision: decision.into(),
            tools,
        }
    }
}

/// Final state of one task plus its reasoning trace.
#[derive(Debug)]
pub struct TaskOutcome {
    pub state: TaskState,
    pub trace: Vec<TraceEntry>,
}

impl TaskOutcome {
    pub fn answer(&self) -> &str {
        self.state.final_answer().unwrap_or_default()
    }

    pub fn is_fatal(&self) -> bool {
        self.state.is_fatal()
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.state.error_detail()
    }
}

/// Main orchestrator that coordinates supervisor and workers
pub struct Orchestrator {
    supervisor: Supervisor,
    workers: HashMap<WorkerName, Worker>,
    refs: Arc<ReferenceStore>,
    store: Arc<dyn StatementStore>,
}

impl Orchestrator {
    pub fn new(
        supervisor: Supervisor,
        workers: Vec<Worker>,
        refs: Arc<ReferenceStore>,
        store: Arc<dyn StatementStore>,
    ) -> Self {
        Self {
            supervisor,
            workers: workers.into_iter().map(|w| (w.name(), w)).collect(),
            refs,
            store,
        }
    }

    /// The standard Scribe / Sage / Fallback roster.
    ///
    /// `model` drives the supervisor, Scribe and Fallback; `insights_model`
    /// drives Sage.
    pub fn standard(
        model: Arc<dyn ChatModel>,
        insights_model: Arc<dyn ChatModel>,
        deps: ToolDeps,
        refs: Arc<ReferenceStore>,
    ) -> Self {
        let workers = vec![
            Worker::new(profile(WorkerName::Scribe), model.clone(), scribe_registry(&deps)),
            Worker::new(profile(WorkerName::Sage), insights_model, sage_registry(&deps)),
            Worker::new(profile(WorkerName::Fallback), model.clone(), ToolRegistry::new()),
        ];
        let supervisor = Supervisor::new(model, WorkerName::ALL.to_vec());
        Self::new(supervisor, workers, refs, deps.store)
    }

    /// Wire Gemini models, the statement store and search from settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        if settings.gemini_api_key.is_empty() {
            warn!("GEMINI_API_KEY not set; every model call will fail");
        }
        let gemini = |model: &str| -> Result<Arc<dyn ChatModel>> {
            let model: Arc<dyn ChatModel> =
                Arc::new(GeminiChatModel::new(settings.gemini_api_key.clone(), model)?);
            Ok(model)
        };

        let deps = ToolDeps {
            store: db::connect(settings)?,
            search: search::from_settings(settings)?,
            parser: gemini(&settings.parser_model_name)?,
            classifier: gemini(&settings.classifier_model_name)?,
            pacing: settings.pacing,
        };
        let refs = Arc::new(ReferenceStore::new(
            settings.ref_store_ttl,
            settings.ref_store_capacity,
        ));

        info!(model = %settings.model_name, "Orchestrator initialized");
        Ok(Self::standard(
            gemini(&settings.model_name)?,
            gemini(&settings.insights_model_name)?,
            deps,
            refs,
        ))
    }

    pub fn refs(&self) -> &Arc<ReferenceStore> {
        &self.refs
    }

    /// Walk the graph for one task until FINISH.
    pub async fn run(&self, mut state: TaskState, progress: &ProgressSink) -> Result<TaskOutcome> {
        let start = Instant::now();
        let mut trace = Vec::new();
        let mut hops = 0usize;

        info!(task_id = %state.task_id, "Task started");

        loop {
            let directive = self.supervisor.decide(&mut state).await?;
            trace.push(TraceEntry::new("Supervisor", directive.to_string(), Vec::new()));

            let name = match directive {
                RouteDirective::Finish => break,
                RouteDirective::Worker(name) => name,
            };

            hops += 1;
            if hops > MAX_SUPERVISOR_HOPS {
                return Err(OrchestrationError::MaxHopsExceeded(format!(
                    "task {} exceeded {} worker dispatches",
                    state.task_id, MAX_SUPERVISOR_HOPS
                )));
            }

            let worker = self.workers.get(&name).ok_or_else(|| {
                OrchestrationError::RoutingContract(format!("no worker registered as '{}'", name))
            })?;

            progress.emit(format!("{} is on it", name));
            worker.run(&mut state, &self.refs, progress, &mut trace).await?;
        }

        info!(
            task_id = %state.task_id,
            hops,
            fatal = state.is_fatal(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Task finished"
        );

        Ok(TaskOutcome { state, trace })
    }

    /// Drop every cached artifact and close the database pool.
    pub async fn shutdown(&self) {
        self.refs.clear().await;
        self.store.close().await;
        info!("Orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Pacing;
    use crate::db::InMemoryStatementStore;
    use crate::llm::{CallKind, ScriptedModel};
    use crate::memory::Message;
    use crate::models::TransactionFilter;
    use crate::search::StaticSearch;
    use crate::state::TaskContext;
    use serde_json::{json, Value};
    use std::path::Path;
    use std::time::Duration;

    struct Harness {
        orchestrator: Orchestrator,
        model: Arc<ScriptedModel>,
        parser: Arc<ScriptedModel>,
        store: Arc<InMemoryStatementStore>,
    }

    fn harness(model: ScriptedModel, parser: ScriptedModel, classifier: ScriptedModel) -> Harness {
        let model = Arc::new(model);
        let parser = Arc::new(parser);
        let store = Arc::new(InMemoryStatementStore::new());
        let deps = ToolDeps {
            store: store.clone(),
            search: Arc::new(StaticSearch::new().with_hit("tango", "Tango Energy", "Electricity retailer")),
            parser: parser.clone(),
            classifier: Arc::new(classifier),
            pacing: Pacing {
                batch_delay: Duration::ZERO,
                classify_batch_size: 10,
            },
        };
        let refs = Arc::new(ReferenceStore::new(Duration::from_secs(600), 100));
        let orchestrator = Orchestrator::standard(model.clone(), model.clone(), deps, refs);
        Harness {
            orchestrator,
            model,
            parser,
            store,
        }
    }

    fn task(folder: &Path, text: &str) -> TaskState {
        TaskState::new(TaskContext::with_input_folder(folder), vec![Message::user(text)])
    }

    fn parsed_statement() -> Value {
        json!({
            "account_holder": "A. Holder",
            "account_name": "Everyday",
            "start_date": "2025-04-01",
            "end_date": "2025-04-30",
            "opening_balance": 2000,
            "closing_balance": 4000,
            "transactions": [
                {"transaction_date": "2025-04-01", "transaction_details": "Tango Energy", "amount": 45},
                {"transaction_date": "2025-04-02", "transaction_details": "Uber Eats", "amount": 34}
            ]
        })
    }

    fn decisions(trace: &[TraceEntry]) -> Vec<(String, String)> {
        trace.iter().map(|t| (t.node.clone(), t.decision.clone())).collect()
    }

    #[tokio::test]
    async fn test_happy_path_processes_statement_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("acme_2025-04.txt"),
            "bank statement\n01/04/2025 Tango Energy $45\n02/04/2025 Uber Eats $34\n",
        )
        .await
        .unwrap();

        let h = harness(
            ScriptedModel::new()
                .then_structured(json!({"next": "Scribe"}))
                .then_tool("extract_all_texts", json!({}))
                .then_tool("parse_all_statements", json!({}))
                .then_tool("write_all_statements", json!({}))
                .then_tool("read_transactions", json!({"uncategorized_only": true}))
                .then_tool("classify_transactions", json!({}))
                .then_tool("update_transaction_classification", json!({}))
                .then_answer("Processed 1 statement and categorised 2 transactions."),
            ScriptedModel::new().then_structured(parsed_statement()),
            ScriptedModel::new().then_structured(json!({"classifications": [
                {"transaction_id": 2, "category": "Dining"},
                {"transaction_id": 1, "category": "Utilities"}
            ]})),
        );

        let (progress, mut rx) = ProgressSink::channel();
        let outcome = h
            .orchestrator
            .run(task(dir.path(), "Process my statements"), &progress)
            .await
            .unwrap();

        assert!(!outcome.is_fatal(), "{:?}", outcome.error_detail());
        assert_eq!(outcome.answer(), "Processed 1 statement and categorised 2 transactions.");
        assert_eq!(h.store.statement_count().await, 1);
        let uncategorized = TransactionFilter {
            uncategorized_only: true,
            ..TransactionFilter::default()
        };
        assert!(h.store.read_transactions(&uncategorized).await.unwrap().is_empty());

        // the worker's FINISH ends the task without a second classification
        assert_eq!(h.model.call_count(CallKind::Structured).await, 1);
        let trace = decisions(&outcome.trace);
        assert_eq!(trace.first().unwrap(), &("Supervisor".to_string(), "Scribe".to_string()));
        assert_eq!(trace[trace.len() - 2], ("Scribe".to_string(), "FINISH".to_string()));
        assert_eq!(trace.last().unwrap(), &("Supervisor".to_string(), "FINISH".to_string()));

        // artifacts stayed out of the transcript: only keys and counts
        assert!(outcome.state.messages().iter().all(|m| !m.content.contains("Tango Energy $45")));

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        assert!(lines.iter().all(|l| l.starts_with(PROGRESS_PREFIX)));
        assert!(lines.iter().any(|l| l.contains("classify_transactions")));
    }

    #[tokio::test]
    async fn test_malformed_filename_stops_before_parsing() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("statement.txt"), "bank statement").await.unwrap();

        let h = harness(
            ScriptedModel::new()
                .then_structured(json!({"next": "Scribe"}))
                .then_tool("extract_all_texts", json!({}))
                .then_tool("parse_all_statements", json!({})),
            ScriptedModel::new(),
            ScriptedModel::new(),
        );

        let outcome = h
            .orchestrator
            .run(task(dir.path(), "Process my statements"), &ProgressSink::disabled())
            .await
            .unwrap();

        assert!(outcome.is_fatal());
        assert!(outcome.error_detail().unwrap().contains("statement.txt"));
        assert!(outcome.answer().contains("statement.txt"));
        assert_eq!(h.model.call_count(CallKind::Structured).await, 1);

        // one decision turn, then one tool-free closing turn whose tool request is ignored
        let invokes: Vec<_> = h
            .model
            .calls()
            .await
            .into_iter()
            .filter(|c| c.kind == CallKind::Invoke)
            .collect();
        assert_eq!(invokes.len(), 2);
        assert!(!invokes[0].tools.is_empty());
        assert!(invokes[1].tools.is_empty());
        assert!(outcome
            .state
            .messages()
            .iter()
            .all(|m| m.tool_name.as_deref() != Some("parse_all_statements")));
        assert!(h.parser.calls().await.is_empty());
        assert_eq!(h.store.statement_count().await, 0);
        assert_eq!(outcome.trace.last().unwrap().decision, "FINISH");
    }

    #[tokio::test]
    async fn test_off_domain_goes_to_fallback_in_one_pass() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            ScriptedModel::new()
                .then_structured(json!({"next": "Fallback"}))
                .then_answer("I can only help with your bank statements."),
            ScriptedModel::new(),
            ScriptedModel::new(),
        );

        let outcome = h
            .orchestrator
            .run(task(dir.path(), "Who won the football?"), &ProgressSink::disabled())
            .await
            .unwrap();

        assert_eq!(
            decisions(&outcome.trace),
            vec![
                ("Supervisor".to_string(), "Fallback".to_string()),
                ("Fallback".to_string(), "FINISH".to_string()),
                ("Supervisor".to_string(), "FINISH".to_string()),
            ]
        );
        let calls = h.model.calls().await;
        assert_eq!(calls.len(), 2);
        assert!(calls[1].tools.is_empty());
    }

    #[tokio::test]
    async fn test_reference_miss_becomes_fatal_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            ScriptedModel::new()
                .then_structured(json!({"next": "Scribe"}))
                .then_tool("classify_transactions", json!({"transactions_ref": "expired-key"}))
                .then_answer("Those transactions are no longer available, so I stopped. Nothing was retried."),
            ScriptedModel::new(),
            ScriptedModel::new(),
        );

        let outcome = h
            .orchestrator
            .run(task(dir.path(), "Categorise my transactions"), &ProgressSink::disabled())
            .await
            .unwrap();

        assert!(outcome.is_fatal());
        assert!(outcome.error_detail().unwrap().contains("expired-key"));
        assert_eq!(
            outcome.answer(),
            "Those transactions are no longer available, so I stopped. Nothing was retried."
        );
    }

    #[tokio::test]
    async fn test_unknown_route_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            ScriptedModel::new().then_structured(json!({"next": "Banker"})),
            ScriptedModel::new(),
            ScriptedModel::new(),
        );

        let err = h
            .orchestrator
            .run(task(dir.path(), "hello"), &ProgressSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::RoutingContract(_)));
        assert_eq!(h.model.call_count(CallKind::Invoke).await, 0);
    }

    #[tokio::test]
    async fn test_hop_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = ScriptedModel::new();
        for _ in 0..MAX_SUPERVISOR_HOPS {
            model = model
                .then_structured(json!({"next": "Sage"}))
                .then_answer("Could you tell me which month?");
        }
        let h = harness(model.then_structured(json!({"next": "Sage"})), ScriptedModel::new(), ScriptedModel::new());

        let err = h
            .orchestrator
            .run(task(dir.path(), "How much did I spend?"), &ProgressSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::MaxHopsExceeded(_)));
    }

    #[tokio::test]
    async fn test_identical_model_responses_give_identical_traces() {
        let script = || {
            ScriptedModel::new()
                .then_structured(json!({"next": "Sage"}))
                .then_tool("summarize_spending", json!({"start_date": "2025-04-01"}))
                .then_tool("search_web", json!({"query": "tango energy"}))
                .then_answer("You spent nothing in April.")
        };

        let mut traces = Vec::new();
        for _ in 0..2 {
            let dir = tempfile::tempdir().unwrap();
            let h = harness(script(), ScriptedModel::new(), ScriptedModel::new());
            let outcome = h
                .orchestrator
                .run(task(dir.path(), "What did I spend in April?"), &ProgressSink::disabled())
                .await
                .unwrap();
            assert!(!outcome.is_fatal());
            traces.push(outcome.trace);
        }

        assert_eq!(traces[0], traces[1]);
        assert_eq!(traces[0][1].tools, vec!["summarize_spending".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_clears_references() {
        let h = harness(ScriptedModel::new(), ScriptedModel::new(), ScriptedModel::new());
        h.orchestrator.refs().put(String::from("artifact")).await;
        h.orchestrator.shutdown().await;
        assert!(h.orchestrator.refs().is_empty().await);
    }
}
