use finnie_orchestrator::{
    agent::{Orchestrator, ProgressSink, AGENT_NAME},
    config::Settings,
    session::{strip_progress, Session},
    state::TaskContext,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

fn init_logging(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&settings.log_path)?;

    let stdout_layer = settings.log_stdout.then(|| fmt::layer().with_writer(std::io::stdout));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        .with(stdout_layer)
        .init();
    Ok(())
}

fn prompt() {
    print!("\nYou: ");
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let settings = Settings::from_env()?;
    init_logging(&settings)?;

    info!("Finnie session driver starting");
    let orchestrator = Orchestrator::from_settings(&settings)?;

    let context = settings
        .input_folder
        .clone()
        .map(TaskContext::with_input_folder)
        .unwrap_or_default();
    let mut session = Session::new(Uuid::new_v4(), settings.history_window, context);

    println!("{}: Hi! I can process your bank statements and answer questions about your spending.", AGENT_NAME);
    println!("(type 'exit' to quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };

        let Some(line) = line else { break };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if matches!(text, "exit" | "quit") {
            break;
        }

        let (progress, mut rx) = ProgressSink::channel();
        let renderer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Some(p) = strip_progress(&line) {
                    println!("  … {}", p);
                }
            }
        });

        let result = tokio::select! {
            result = session.run_turn(&orchestrator, text, &progress) => Some(result),
            _ = tokio::signal::ctrl_c() => None,
        };
        drop(progress);
        let _ = renderer.await;

        match result {
            None => {
                println!();
                break;
            }
            Some(Ok(reply)) => {
                for p in &reply.progress {
                    println!("  … {}", p);
                }
                println!("{}: {}", AGENT_NAME, reply.answer);
            }
            Some(Err(e)) => {
                error!(error = %e, "Turn failed");
                println!("{}: Something went wrong talking to the model ({}). Please try again.", AGENT_NAME, e);
            }
        }
    }

    orchestrator.shutdown().await;
    println!("Goodbye!");
    Ok(())
}
