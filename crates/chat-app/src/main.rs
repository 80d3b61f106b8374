use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use quill_core::SettingsStore;
use quill_storage::SqliteStore;
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

mod command;
mod session;

use command::Command;
use session::{AppResult, ChatSession, Flow, IoSnafu, OpenDatabaseSnafu};

const DATABASE_FILE_NAME: &str = "quill.db";

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join("quill"))
        .unwrap_or_else(|| PathBuf::from(".quill"))
        .join(DATABASE_FILE_NAME)
}

#[tokio::main]
async fn main() {
    // Logs go to stderr so replies stay readable on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        tracing::error!(%error, "quill stopped");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let settings = SettingsStore::load();
    tracing::info!(path = ?settings.config_path(), "settings loaded");

    let database_path = default_database_path();
    let store = SqliteStore::open(&database_path.to_string_lossy())
        .await
        .context(OpenDatabaseSnafu)?;
    tracing::info!(database_url = store.database_url(), "conversation store ready");

    let mut session = ChatSession::new(settings, Arc::new(store));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();
    writeln!(stdout, "quill, type /help for commands").context(IoSnafu { stage: "banner" })?;

    loop {
        write!(stdout, "> ").context(IoSnafu { stage: "prompt" })?;
        stdout.flush().context(IoSnafu { stage: "prompt" })?;

        let Some(line) = lines
            .next_line()
            .await
            .context(IoSnafu { stage: "read-line" })?
        else {
            break;
        };

        match session.handle(Command::parse(&line), &mut stdout).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(error) => {
                tracing::warn!(%error, "command failed");
                writeln!(stdout, "error: {error}").context(IoSnafu { stage: "report" })?;
            }
        }
    }

    Ok(())
}
