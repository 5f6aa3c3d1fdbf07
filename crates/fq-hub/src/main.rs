use clap::Parser;
use fq_hub::api::{router, AppState};
use fq_hub::{Config, Engine, SchemaCache};
use fq_store::http::HttpBackend;
use fq_store::Version;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "fq-hub", version, about = "Faceted query service over a document store")]
struct Args {
    /// Path to config file
    #[arg(long, default_value = "fq-hub.toml")]
    config: PathBuf,

    /// Server bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Backend base URL (overrides the config file)
    #[arg(long)]
    backend_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "fq_hub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config);
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(url) = args.backend_url {
        config.backend.url = url;
    }

    let version = Version::parse(&config.backend.version).unwrap_or_else(|| {
        tracing::warn!(
            "Can not read backend version {:?}, assuming {}",
            config.backend.version,
            Version::default()
        );
        Version::default()
    });
    let backend = HttpBackend::new(
        &config.backend.url,
        version,
        config.backend.timeout_secs.map(Duration::from_secs),
    )?;
    tracing::info!("Backend {} (protocol {})", config.backend.url, version);

    let engine = Engine::new(Arc::new(backend), Arc::new(SchemaCache::new()), config.settings());
    let app = router(Arc::new(AppState { engine }));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!("fq-hub listening on {}", config.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}
