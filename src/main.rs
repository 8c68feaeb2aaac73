use std::io::Write;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use relay_core::ids::{ApprovalId, ConversationId, RunId};
use relay_core::stream::{NullSink, StreamEvent};
use relay_engine::{Orchestrator, TurnOutcome};
use relay_llm::CallMode;
use relay_settings::{load_settings, resolve_path};
use relay_store::{ApprovalDecision, Database};
use relay_telemetry::{init_telemetry, LogQuery, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "relay", about = "Personal assistant runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Talk to the assistant. Reads lines from stdin when no message is given.
    Chat {
        /// Continue an existing conversation.
        #[arg(long)]
        conversation: Option<String>,
        /// Wait for the full answer instead of streaming it.
        #[arg(long)]
        no_stream: bool,
        message: Option<String>,
    },
    #[command(subcommand)]
    Providers(ProvidersCommand),
    #[command(subcommand)]
    Approvals(ApprovalsCommand),
    #[command(subcommand)]
    Subagents(SubagentsCommand),
    /// Query persisted warn+ log events.
    Logs {
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[derive(Subcommand, Debug)]
enum ProvidersCommand {
    /// Show the fallback chain and each provider's state.
    List,
    Enable { name: String },
    Disable { name: String },
    /// Send a probe request to one provider and record the outcome.
    Test { name: String },
}

#[derive(Subcommand, Debug)]
enum ApprovalsCommand {
    List {
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Decisions: once, always, deny.
    Resolve { id: String, decision: String },
}

#[derive(Subcommand, Debug)]
enum SubagentsCommand {
    List {
        #[arg(long)]
        conversation: Option<String>,
    },
    History { run_id: String },
    Stop { run_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = load_settings().context("failed to load settings")?;
    let telemetry = init_telemetry(TelemetryConfig::from_settings(&settings));

    let db_path = resolve_path(&settings.storage.database_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let orchestrator = Orchestrator::from_settings(&settings, db);

    match cli.command {
        Command::Chat {
            conversation,
            no_stream,
            message,
        } => {
            let report = orchestrator.recover()?;
            if !report.interrupted.is_empty() {
                tracing::warn!(count = report.interrupted.len(), "interrupted subagent runs from a previous process");
            }
            let conversation = conversation
                .map(ConversationId::from_raw)
                .unwrap_or_default();
            let mode = if no_stream { CallMode::Blocking } else { CallMode::Streaming };
            chat(&orchestrator, &conversation, mode, message).await?;
        }
        Command::Providers(cmd) => providers(&orchestrator, cmd).await?,
        Command::Approvals(cmd) => approvals(&orchestrator, cmd).await?,
        Command::Subagents(cmd) => subagents(&orchestrator, cmd)?,
        Command::Logs {
            level,
            provider,
            conversation,
            limit,
        } => {
            let Some(logs) = telemetry.logs() else {
                bail!("SQLite logging is disabled (logging.logToSqlite)");
            };
            let records = logs.query(&LogQuery {
                level,
                provider,
                conversation_id: conversation,
                limit: Some(limit),
                ..Default::default()
            })?;
            for r in records {
                println!("{} {:5} {} {}", r.timestamp, r.level, r.target, r.message);
            }
        }
    }

    orchestrator.shutdown();
    Ok(())
}

fn print_stream(event: StreamEvent) {
    if let StreamEvent::TextDelta { text, .. } = event {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }
}

async fn chat(
    orchestrator: &Orchestrator,
    conversation: &ConversationId,
    mode: CallMode,
    message: Option<String>,
) -> anyhow::Result<()> {
    if let Some(message) = message {
        let outcome = orchestrator.run_turn(conversation, &message, mode, &print_stream).await?;
        report_turn(&outcome, mode);
        return Ok(());
    }

    println!("conversation {conversation}  (/approve <id> [always], /deny <id>, /quit)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut words = line.split_whitespace();
        let result = match words.next() {
            Some("/quit") => break,
            Some("/approve") | Some("/deny") => {
                let deny = line.starts_with("/deny");
                match words.next() {
                    Some(id) => {
                        let decision = match (deny, words.next()) {
                            (true, _) => ApprovalDecision::Denied,
                            (false, Some("always")) => ApprovalDecision::ApprovedAlways,
                            (false, _) => ApprovalDecision::ApprovedOnce,
                        };
                        orchestrator
                            .resolve_approval(&ApprovalId::from_raw(id), decision, &print_stream)
                            .await
                            .map(|outcome| outcome.turn)
                    }
                    None => {
                        eprintln!("usage: /approve <id> [always] | /deny <id>");
                        continue;
                    }
                }
            }
            _ => orchestrator
                .run_turn(conversation, line, mode, &print_stream)
                .await
                .map(Some),
        };
        match result {
            Ok(Some(outcome)) => report_turn(&outcome, mode),
            Ok(None) => println!("(approval recorded)"),
            Err(e) => eprintln!("error [{}]: {e}", e.kind()),
        }
    }
    Ok(())
}

fn report_turn(outcome: &TurnOutcome, mode: CallMode) {
    match outcome {
        TurnOutcome::Final { answer, .. } => {
            if mode == CallMode::Blocking {
                print!("{}", answer.visible_text());
            }
            println!();
        }
        TurnOutcome::AwaitingApproval { approvals } => {
            println!();
            for approval in approvals {
                println!("approval needed: {}  `{}`", approval.approval_id, approval.command);
            }
        }
    }
}

async fn providers(orchestrator: &Orchestrator, cmd: ProvidersCommand) -> anyhow::Result<()> {
    match cmd {
        ProvidersCommand::List => {
            for (name, state) in orchestrator.provider_states().await? {
                let status = if state.is_eligible() {
                    "eligible".to_string()
                } else if !state.enabled {
                    "disabled".to_string()
                } else {
                    format!("auto-disabled ({})", state.disabled_reason)
                };
                println!("{name:20} {status}");
            }
        }
        ProvidersCommand::Enable { name } => {
            orchestrator.set_provider_enabled(&name, true).await?;
            println!("{name} enabled");
        }
        ProvidersCommand::Disable { name } => {
            orchestrator.set_provider_enabled(&name, false).await?;
            println!("{name} disabled");
        }
        ProvidersCommand::Test { name } => {
            let report = orchestrator.test_provider(&name).await?;
            match &report.error {
                None => println!("{name}: ok"),
                Some((class, message)) => println!("{name}: {class}: {message}"),
            }
        }
    }
    Ok(())
}

async fn approvals(orchestrator: &Orchestrator, cmd: ApprovalsCommand) -> anyhow::Result<()> {
    match cmd {
        ApprovalsCommand::List { conversation } => {
            let conversation = conversation.map(ConversationId::from_raw);
            for row in orchestrator.pending_approvals(conversation.as_ref())? {
                println!("{}  {}  `{}`  {}", row.id, row.conversation_id, row.command, row.created_at);
            }
        }
        ApprovalsCommand::Resolve { id, decision } => {
            let decision: ApprovalDecision = decision
                .parse()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let outcome = orchestrator
                .resolve_approval(&ApprovalId::from_raw(id), decision, &NullSink)
                .await?;
            println!("{} {}", outcome.resolution.approval.id, outcome.resolution.approval.status);
            if let Some(turn) = &outcome.turn {
                report_turn(turn, CallMode::Blocking);
            }
        }
    }
    Ok(())
}

fn subagents(orchestrator: &Orchestrator, cmd: SubagentsCommand) -> anyhow::Result<()> {
    let subagents = orchestrator.subagents();
    match cmd {
        SubagentsCommand::List { conversation } => {
            let conversation = conversation.map(ConversationId::from_raw);
            for run in subagents.list(conversation.as_ref())? {
                println!(
                    "{}  {:11}  {}  {}",
                    run.id,
                    run.status.as_str(),
                    run.created_at,
                    run.instructions.lines().next().unwrap_or_default()
                );
            }
        }
        SubagentsCommand::History { run_id } => {
            for stored in subagents.history(&RunId::from_raw(run_id))? {
                println!("[{}] {}", stored.message.role(), stored.message.text());
            }
        }
        SubagentsCommand::Stop { run_id } => {
            let run = subagents.stop(&RunId::from_raw(run_id))?;
            println!("{} {}", run.id, run.status);
        }
    }
    Ok(())
}
