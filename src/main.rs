use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use mockcall::{
    logger, Access, CallConfig, CallController, CallEvent, CallTarget, CallTargetId,
    ConnectionState,
};

/// How long the process lingers after hanging up so the completion request can go out.
const FLUSH_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AccessArg {
    Anonymous,
    Free,
    Paid,
}

impl From<AccessArg> for Access {
    fn from(arg: AccessArg) -> Self {
        match arg {
            AccessArg::Anonymous => Access::Anonymous,
            AccessArg::Free => Access::Free,
            AccessArg::Paid => Access::Paid,
        }
    }
}

/// Runs one realtime mock-interview call and prints its events as JSON lines.
#[derive(Parser, Debug)]
#[command(name = "mockcall")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Case or interview id
    target: String,

    /// Question number within the case
    #[arg(short, long)]
    question: Option<u32>,

    #[arg(long)]
    title: Option<String>,

    #[arg(short, long, value_enum, default_value = "anonymous")]
    access: AccessArg,

    /// Start with the microphone muted
    #[arg(long)]
    muted: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    logger::init();

    let cli = Cli::parse();
    let config = CallConfig::from_env().context("loading configuration")?;
    let target = CallTarget::new(CallTargetId::new(cli.target)?)
        .with_question(cli.question)
        .with_title(cli.title);

    let controller = CallController::with_defaults(target, cli.access.into(), config)?;
    let mut events = controller.subscribe();
    if cli.muted {
        controller.toggle_mute();
    }

    controller
        .connect()
        .await
        .context("could not start the call")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, hanging up");
                controller.end_call().await;
                tokio::time::sleep(FLUSH_WAIT).await;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    let finished = matches!(
                        event,
                        CallEvent::Navigate { .. }
                            | CallEvent::StateChanged { to: ConnectionState::Failed, .. }
                    );
                    if finished {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let snapshot = controller.snapshot();
    println!("{}", serde_json::to_string(&snapshot)?);
    controller.unmount().await;
    Ok(())
}
