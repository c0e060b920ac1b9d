use std::sync::Arc;

use llmux::config::Config;
use llmux::transport::TransportHost;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries protocol frames; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env next to the binary (the UI may spawn us from any CWD),
    // falling back to dotenvy's CWD search.
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")))
        .filter(|path| path.exists());
    match beside_exe {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    tracing::info!("llmux starting");

    let config = Config::load()?;
    let host = Arc::new(TransportHost::new(&config));

    host.serve(tokio::io::stdin(), tokio::io::stdout())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    tracing::info!("llmux shutting down");
    Ok(())
}
