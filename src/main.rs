use tracing_subscriber::{fmt, EnvFilter};

use chat_pipeline::{app, config::Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // RUST_LOG wins; info otherwise
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    app::run(Config::from_env()).await
}
