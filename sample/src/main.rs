mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracebridge::{Bridge, ContextTaskStore, Engine, Environment, Mode, TaskStore};
use tracing::info;

#[derive(ValueEnum, Debug, Clone, Copy)]
enum RunMode {
    Dev,
    Prod,
}

#[derive(Parser, Debug, Clone)]
struct Args {
    /// Port to listen on.
    #[clap(long, default_value_t = 9000)]
    port: u16,
    /// Overrides the mode read from `TRACEBRIDGE_MODE`.
    #[clap(long, value_enum)]
    mode: Option<RunMode>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracebridge::log::init()?;

    let args = Args::parse();

    let environment = match args.mode {
        Some(RunMode::Dev) => Environment::new(Mode::Dev),
        Some(RunMode::Prod) => Environment::new(Mode::Prod),
        None => Environment::from_env(),
    };

    let store: Arc<dyn TaskStore> = Arc::new(ContextTaskStore::new());
    let bridge = Bridge::new(Engine::from_current()?, store.clone());
    let router = routes::router(bridge, store, environment.clone());

    let address = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = tokio::net::TcpListener::bind(address).await?;

    info!(url = %format!("http://{address}/"), mode = ?environment.mode, "starting a HTTP server");

    axum::serve(listener, router).await?;

    Ok(())
}
