use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use federation::cli::{Cli, Commands};
use federation::completion::genai_service::GenaiCompletion;
use federation::config::{self, AppConfig};
use federation::federation::{Federation, FederationOptions};
use federation::orchestration::event_log::EventLog;
use federation::orchestration::events::{Event, EventKind};
use federation::worker::WorkspaceTools;

/// Per-request limit for a single completion call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the streamed master text.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli).context("Failed to load configuration")?;
    tracing::info!(model = %config.model, workspace = %config.workspace.display(), "Config loaded");

    match cli.command {
        Commands::Templates => {
            for t in &config.templates {
                println!("{:<12} {}\n{:<12} tools: {}", t.name, t.description, "", t.tools.join(", "));
            }
            Ok(())
        }
        Commands::Run { message } => {
            let (federation, log) = build(&config)?;
            let outcome = tokio::select! {
                outcome = federation.run(&message) => Some(outcome),
                _ = tokio::signal::ctrl_c() => None,
            };
            println!();
            federation.shutdown().await;
            match outcome {
                Some(Ok(_)) => {
                    log.log_session_end("completed").ok();
                    Ok(())
                }
                Some(Err(e)) => {
                    log.log_session_end("error").ok();
                    Err(e).context("Master turn failed")
                }
                None => {
                    log.log_session_end("interrupted").ok();
                    eprintln!("Interrupted");
                    Ok(())
                }
            }
        }
        Commands::Chat => {
            let (federation, log) = build(&config)?;
            let outcome = chat(&federation).await;
            federation.shutdown().await;
            match outcome {
                Ok(reason) => {
                    log.log_session_end(reason).ok();
                    Ok(())
                }
                Err(e) => {
                    log.log_session_end("error").ok();
                    Err(e)
                }
            }
        }
    }
}

/// Wire the federation, its session log and the console printer.
fn build(config: &AppConfig) -> anyhow::Result<(Federation, EventLog)> {
    let tools = WorkspaceTools::new(&config.workspace).with_context(|| {
        format!("Failed to initialize workspace {}", config.workspace.display())
    })?;
    let workspace_root = tools.root().to_path_buf();
    let service = Arc::new(GenaiCompletion::new(config.model.clone(), REQUEST_TIMEOUT));

    let federation = Federation::new(
        service,
        tools,
        config.templates.clone(),
        FederationOptions::from_config(config),
    )?;

    let log = EventLog::new(&workspace_root)?;
    log.log_session_start(&config.model, &workspace_root)?;
    log.attach(federation.events());
    tracing::info!(path = %log.log_path().display(), "Session log opened");

    federation.subscribe(print_event);
    Ok((federation, log))
}

/// Console presentation: streamed master text on stdout, worker lifecycle
/// lines on stderr.
fn print_event(event: &Event) {
    let worker = event.worker_id.as_deref().unwrap_or("-");
    match event.kind {
        EventKind::MasterText => {
            print!("{}", event.payload_str("text").unwrap_or_default());
            std::io::stdout().flush().ok();
        }
        EventKind::MasterToolCall => {
            eprintln!("  -> {}", event.payload_str("tool").unwrap_or("?"));
        }
        EventKind::MasterError => {
            eprintln!("[master] error: {}", event.payload_str("error").unwrap_or("?"));
        }
        EventKind::WorkerSpawned => {
            eprintln!("[{worker}] spawned ({})", event.payload_str("type").unwrap_or("?"));
        }
        EventKind::WorkerStarted => {
            eprintln!("[{worker}] started: {}", preview(event.payload_str("task").unwrap_or("")));
        }
        EventKind::WorkerToolCall => {
            eprintln!("[{worker}] tool {}", event.payload_str("tool").unwrap_or("?"));
        }
        EventKind::WorkerDone => eprintln!("[{worker}] done"),
        EventKind::WorkerError => {
            eprintln!("[{worker}] failed: {}", event.payload_str("error").unwrap_or("?"));
        }
        EventKind::WorkerCancelled => eprintln!("[{worker}] cancelled"),
        EventKind::WorkerTerminated => eprintln!("[{worker}] terminated"),
        EventKind::DelegationChained => {
            eprintln!("[{worker}] result passed to {}", event.payload_str("target").unwrap_or("?"));
        }
        EventKind::DelegationFailed => {
            eprintln!("[{worker}] chaining failed: {}", event.payload_str("error").unwrap_or("?"));
        }
        EventKind::StatusUpdate => {
            eprintln!("{}", event.payload_str("message").unwrap_or_default());
        }
        _ => {}
    }
}

fn preview(text: &str) -> String {
    let first = text.lines().next().unwrap_or_default();
    if first.chars().count() > 80 {
        format!("{}...", first.chars().take(80).collect::<String>())
    } else {
        first.to_string()
    }
}

/// One master turn per input line until EOF, `/quit` or Ctrl-C. Ctrl-C also
/// interrupts a running turn. Returns the session end reason.
async fn chat(federation: &Federation) -> anyhow::Result<&'static str> {
    println!("Agent federation. Commands: /workers, /reset, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok("interrupted");
            }
        };
        let Some(line) = line else { break };
        let input = line.trim();

        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/workers" => {
                for row in federation.worker_table() {
                    println!(
                        "{}  {:<12} {:<10} {}",
                        row.id,
                        row.worker_type,
                        row.status.as_str(),
                        row.current_task.as_deref().map(preview).unwrap_or_default()
                    );
                }
            }
            "/reset" => {
                federation.reset_conversation().await;
                println!("Conversation cleared.");
            }
            message => {
                tokio::select! {
                    outcome = federation.run(message) => {
                        if let Err(e) = outcome {
                            eprintln!("error: {e}");
                        }
                        println!();
                    }
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        eprintln!("Interrupted");
                        return Ok("interrupted");
                    }
                }
            }
        }
    }
    Ok("user_exit")
}
