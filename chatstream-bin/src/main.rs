use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use chatstream_core::{
    accumulator::{DeltaAccumulator, format_speed},
    config::Config,
    controller::StreamController,
    message_store::InMemoryMessageStore,
    model::{ChatMessage, CompletionRequest, Role},
    persistence::PersistenceAdapter,
    render::RenderFrame,
    state::StreamState,
    transport::ByteStream,
};
use clap::{Parser, Subcommand};
use futures_util::stream;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "chatstream CLI: stream, replay and inspect completions", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML). Without one, a local OpenAI-compatible endpoint is assumed.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Directory for stream snapshots; overrides the config file.
    #[arg(long, global = true)]
    state_dir: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a chat completion (prints deltas live)
    Chat {
        #[arg(long)]
        model: Option<String>,
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long, help = "Message id for the answer (default: generated)")]
        id: Option<String>,
        #[arg(long, help = "Ask for a single non-streamed response")]
        once: bool,
    },
    /// Ingest a captured text/event-stream file offline
    Replay {
        file: PathBuf,
        #[arg(long, default_value = "replay")]
        id: String,
        #[arg(long, default_value_t = 64, help = "Bytes per simulated network chunk")]
        chunk: usize,
    },
    /// Show persisted stream snapshots
    Inspect {
        id: Option<String>,
    },
    /// Forget a finished or failed stream and delete its snapshot
    Clear {
        id: String,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::local("http://localhost:8080", "default"),
    };
    if let Some(dir) = &cli.state_dir {
        cfg.persistence.dir = Some(dir.clone());
    }
    Ok(cfg)
}

/// Prints only the part of each cumulative frame not printed yet.
fn stdout_ui() -> impl Fn(&str, &RenderFrame) + Send + Sync + 'static {
    let printed = Mutex::new(0usize);
    move |_id: &str, frame: &RenderFrame| {
        let mut printed = printed.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(new) = frame.content.get(*printed..) {
            print!("{new}");
            io::stdout().flush().ok();
            *printed = frame.content.len();
        }
    }
}

fn report(state: &StreamState) {
    println!();
    match &state.error {
        Some(err) => eprintln!("[{}: {}]", state.status, err),
        None => eprintln!(
            "[{}: {} tokens, {} tok/s]",
            state.status,
            state.completion_tokens,
            format_speed(state.speed)
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;
    let store = Arc::new(InMemoryMessageStore::new());

    match cli.command {
        Commands::Chat {
            model,
            message,
            id,
            once,
        } => {
            let ctrl = StreamController::from_config(&cfg, store)?.with_ui(stdout_ui());
            let id = id.unwrap_or_else(|| {
                let ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or_default();
                format!("msg-{ms}")
            });
            let req = CompletionRequest::new(
                model.unwrap_or_else(|| cfg.endpoint.model.clone()),
                vec![ChatMessage::new(Role::User, message)],
            );
            let state = if once {
                ctrl.respond_once(&id, req).await?
            } else {
                ctrl.generate(&id, req).await?
            };
            report(&state);
        }
        Commands::Replay { file, id, chunk } => {
            let raw = tokio::fs::read(&file).await?;
            let chunks: Vec<Result<Bytes, io::Error>> = raw
                .chunks(chunk.max(1))
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            let bytes: ByteStream = Box::pin(stream::iter(chunks));

            let ctrl = StreamController::from_config(&cfg, store)?;
            let ticket = ctrl.manager().start_stream(&id)?;
            tracing::info!(message_id = %id, stream_id = %ticket.stream_id, file = %file.display(), "replaying capture");
            let state = ctrl
                .ingest(&id, bytes, ticket.cancel, DeltaAccumulator::new())
                .await?;
            print!("{}", state.content);
            report(&state);
        }
        Commands::Inspect { id } => {
            let persistence = PersistenceAdapter::from_config(&cfg.persistence)?;
            let mut ids = match id {
                Some(id) => vec![id],
                None => persistence.message_ids()?,
            };
            ids.sort();
            for id in ids {
                match persistence.load(&id)? {
                    Some(s) => println!(
                        "{id}\t{}\t{} chars\t{} tokens{}{}",
                        s.status,
                        s.content.chars().count(),
                        s.completion_tokens,
                        if s.is_content_complete { "\tcontent-complete" } else { "" },
                        s.error.map(|e| format!("\terror: {e}")).unwrap_or_default(),
                    ),
                    None => println!("{id}\t(no snapshot)"),
                }
            }
        }
        Commands::Clear { id } => {
            let ctrl = StreamController::from_config(&cfg, store)?;
            if ctrl.dismiss(&id)? {
                println!("cleared {id}");
            } else {
                println!("nothing stored for {id}");
            }
        }
    }

    Ok(())
}
