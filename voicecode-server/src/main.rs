//! Entry point: CLI parsing, config/logging setup, and the TCP accept loop
//! (§10.3). All wire-protocol mechanics live in [`transport`]; everything
//! stateful lives in `voicecode_core`.

mod transport;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;
use voicecode_core::connection::ConnectionTable;
use voicecode_core::dispatch::Dispatcher;
use voicecode_core::lock_table::SessionLockTable;
use voicecode_core::recipe::implement_and_review;
use voicecode_core::recipe::load_recipe_file;
use voicecode_core::recipe::Recipe;
use voicecode_core::session_index::SessionIndex;
use voicecode_core::watcher::FilePositionTable;
use voicecode_core::watcher::ReplicationSink;
use voicecode_core::watcher::TranscriptWatcher;
use voicecode_core::watcher::WatcherConfig;
use voicecode_core::workstream::InMemoryWorkstreamStore;
use voicecode_core::workstream::WorkstreamStore;
use voicecode_core::ConfigOverrides;

/// voicecode daemon: mediates between a mobile client and a local coding
/// agent over a single TCP endpoint (§1).
#[derive(Debug, Parser)]
#[clap(author, version)]
struct Cli {
    /// Override `bind_address` from `~/.voicecode/config.toml`.
    #[arg(long)]
    bind_address: Option<String>,

    /// Override the transcript root directory.
    #[arg(long)]
    transcript_root: Option<PathBuf>,

    /// Override the shared-secret key file path.
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Override the agent executable invoked for each turn.
    #[arg(long)]
    agent_executable: Option<String>,

    /// Override the per-invocation agent timeout, in seconds.
    #[arg(long)]
    agent_timeout_secs: Option<u64>,
}

impl From<Cli> for ConfigOverrides {
    fn from(cli: Cli) -> Self {
        Self {
            bind_address: cli.bind_address,
            transcript_root: cli.transcript_root,
            key_file: cli.key_file,
            agent_executable: cli.agent_executable,
            agent_timeout_secs: cli.agent_timeout_secs,
        }
    }
}

fn init_logging() {
    let default_level = "info";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Load every `*.json` file in `recipe_dir` as a recipe (§4.5, §10.5), on
/// top of the bundled `implement-and-review`. A recipe that fails to parse
/// or validate is logged and skipped, not fatal to startup.
fn load_recipes(recipe_dir: &std::path::Path) -> HashMap<String, Recipe> {
    let mut recipes = HashMap::new();
    let bundled = implement_and_review();
    recipes.insert(bundled.id.clone(), bundled);

    let Ok(entries) = std::fs::read_dir(recipe_dir) else {
        return recipes;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match load_recipe_file(&path) {
            Ok(recipe) => {
                recipes.insert(recipe.id.clone(), recipe);
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "skipping invalid recipe file");
            }
        }
    }
    recipes
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let overrides: ConfigOverrides = cli.into();
    let config = voicecode_core::Config::load(overrides)?;

    let api_key = voicecode_core::auth::load_or_bootstrap_key(&config.key_file)?;
    let recipes = load_recipes(&config.recipe_dir);

    let connections = ConnectionTable::new();
    let session_index = SessionIndex::new();
    let positions = FilePositionTable::new();
    let lock_table = SessionLockTable::new();
    let agent = voicecode_core::agent_invoker::AgentInvoker::new(
        config.agent_executable.clone(),
        config.agent_timeout,
    );
    let workstreams: Arc<dyn WorkstreamStore> = Arc::new(InMemoryWorkstreamStore::new());

    let dispatcher = Arc::new(Dispatcher::new(
        connections.clone(),
        session_index.clone(),
        positions.clone(),
        lock_table,
        agent,
        workstreams,
        recipes,
        api_key.clone(),
    ));

    let sink: Arc<dyn ReplicationSink> = dispatcher.clone();
    let watcher = TranscriptWatcher::new(
        WatcherConfig {
            transcript_root: config.transcript_root.clone(),
            debounce: config.watcher_debounce,
        },
        session_index,
        positions,
        sink,
    )?;
    watcher.initial_index()?;
    tokio::spawn(watcher.run());

    voicecode_core::pairing::StdoutPairingSink.print_pairing_instructions(&config.bind_address, &api_key);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(bind_address = %config.bind_address, "voicecode daemon listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let dispatcher = dispatcher.clone();
                let connections = connections.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport::handle_connection(socket, dispatcher, connections).await {
                        error!(peer = %peer, error = %e, "connection ended with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                return Ok(());
            }
        }
    }
}
