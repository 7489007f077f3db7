//! voicenotes CLI: one reconciliation pass per invocation.

use voicenotes::config::Config;
use voicenotes::messaging::TelegramClient;
use voicenotes::reconcile::{Reconciler, discover_chats};
use voicenotes::secrets::ApiToken;
use voicenotes::state::StateStore;

use anyhow::Context as _;
use clap::Parser;

use std::path::PathBuf;
use std::process::ExitCode;

/// Exit status for failures the next scheduled run may recover from
/// (EX_TEMPFAIL).
const EXIT_TRANSIENT: u8 = 75;

#[derive(Parser)]
#[command(name = "voicenotes")]
#[command(about = "Download chat voice notes and delete them once confirmed", long_about = None)]
#[command(version)]
struct Args {
    /// Log at debug level.
    #[arg(short, long)]
    debug: bool,

    /// JSON file holding the bot API token: {"api_token": "..."}.
    secrets: PathBuf,

    /// JSON config: {"chat_id": ..., "recordings_dir": "..."}.
    config: PathBuf,

    /// Directory for the persistent state database.
    state_dir: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    voicenotes::logging::init(args.debug);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let transient = error
                .downcast_ref::<voicenotes::Error>()
                .is_some_and(voicenotes::Error::is_transient);
            tracing::error!(transient, "{error:#}");
            eprintln!("voicenotes: {error:#}");

            if transient {
                ExitCode::from(EXIT_TRANSIENT)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let token = ApiToken::load(&args.secrets)
        .map_err(voicenotes::Error::from)
        .context("failed to load bot credentials")?;
    let config = Config::load(&args.config)
        .map_err(voicenotes::Error::from)
        .context("failed to load config")?;
    let client = TelegramClient::new(token)
        .map_err(voicenotes::Error::from)
        .context("failed to build platform client")?;

    let Some(chat_id) = config.chat_id else {
        tracing::info!("no chat_id configured, listing chats that sent updates");
        let sightings = discover_chats(&client).await?;
        for sighting in &sightings {
            println!(
                "{}\t{}\t{}\t{} update(s)",
                sighting.chat_id, sighting.kind, sighting.label, sighting.updates
            );
        }
        return Ok(());
    };

    let state = StateStore::open(&args.state_dir)
        .map_err(voicenotes::Error::from)
        .with_context(|| format!("failed to open state in {}", args.state_dir.display()))?;
    tracing::debug!(path = %state.path().display(), chat_id, "state opened");

    let report = Reconciler::new(&client, &state, &config.recordings_dir, chat_id)
        .run_pass()
        .await?;

    if report.is_idle() {
        tracing::debug!(cursor = %report.cursor, "nothing to do");
    }
    Ok(())
}
