use std::{path::PathBuf, time::Duration};

use anyhow::Context as _;
use axum::{Router, http::StatusCode, routing::get};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity, log::LevelFilter};
use figment::{Figment, providers::Format as _};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::{
    applier::LabelApplier,
    auth::Session,
    autoban::AutoBan,
    chat::ChatClient,
    config::AppConfig,
    notify::Notifier,
    ozone::OzoneClient,
    poller::Poller,
    retry::RetryPolicy,
    storage::{CURSOR, CursorStore, NOTIFIED_REPORTS, PROCESSED_REPORTS, PersistedSet},
};

/// The application user agent. Concatenates the package name and version. e.g. `autolabeler/0.0.0`.
pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[derive(Parser, Debug, Clone)]
/// Command line arguments.
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "default.toml")]
    pub config: PathBuf,
    /// The verbosity level.
    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

/// The health check route.
async fn health() -> &'static str {
    "OK"
}

/// Routes served next to the poller.
fn routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(|| async { (StatusCode::NOT_FOUND, "Not found") })
        .layer(TraceLayer::new_for_http())
}

/// The main application entry point.
pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    // Set up trace logging to console and account for the user-provided verbosity flag.
    if args.verbosity.log_level_filter() != LevelFilter::Off {
        let lvl = match args.verbosity.log_level_filter() {
            LevelFilter::Error => tracing::Level::ERROR,
            LevelFilter::Warn => tracing::Level::WARN,
            LevelFilter::Info | LevelFilter::Off => tracing::Level::INFO,
            LevelFilter::Debug => tracing::Level::DEBUG,
            LevelFilter::Trace => tracing::Level::TRACE,
        };
        tracing_subscriber::fmt().with_max_level(lvl).init();
    }

    if !args.config.exists() {
        // Not fatal: every setting can come from the environment.
        warn!(
            "configuration file {} does not exist",
            args.config.display()
        );
    }

    // Read and parse the user-provided configuration.
    let config: AppConfig = Figment::new()
        .admerge(figment::providers::Toml::file(&args.config))
        .admerge(figment::providers::Env::prefixed("AUTOLABELER_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    let settings = config.settings().context("invalid configuration")?;

    info!(
        "labeler {} with {} trusted moderators and {} valid labels",
        settings.labeler.as_str(),
        settings.trusted_moderators.len(),
        settings.valid_labels.len()
    );
    for rule in &settings.autoban_rules {
        info!(
            "auto-ban rule: {} at {} points ({} max from other labels)",
            rule.label, rule.threshold, rule.other_cap
        );
    }

    // Initialize metrics reporting.
    super::metrics::setup(&config.metrics).context("failed to set up metrics exporter")?;

    // Create a reqwest client that will be used for all outbound requests.
    let client = reqwest::Client::builder()
        .user_agent(APP_USER_AGENT)
        .timeout(Duration::from_secs(config.request_timeout))
        .build()
        .context("failed to build requester client")?;

    let ozone = OzoneClient::new(
        Session::new(client.clone(), config.labeler.credentials.clone()),
        settings.labeler.clone(),
    );
    let did = ozone
        .login()
        .await
        .context("failed to log in as the labeler")?;
    info!("logged in to {} as {}", config.labeler.credentials.service, did.as_str());

    let chat = ChatClient::new(Session::new(client, config.dm.clone()));
    match chat.login().await {
        Ok(did) => info!("logged in to chat as {}", did.as_str()),
        // Retried lazily on the first message.
        Err(e) => warn!("failed to log in to chat, notifications may fail: {e}"),
    }

    let notifier = Notifier::new(
        chat,
        &settings,
        PersistedSet::open(config.data_dir.join(NOTIFIED_REPORTS)),
    );
    let applier = LabelApplier::new(
        ozone,
        RetryPolicy::default(),
        settings.valid_labels.clone(),
        AutoBan::from_settings(&settings),
        notifier,
    );
    let poller = Poller::new(
        applier,
        &settings,
        CursorStore::open(config.data_dir.join(CURSOR)),
        PersistedSet::open(config.data_dir.join(PROCESSED_REPORTS)),
    );

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .context("failed to bind address")?;
    info!("health check listening on {}", config.listen_address);

    let serve = tokio::spawn(async move {
        axum::serve(listener, routes().into_make_service())
            .await
            .context("failed to serve health check")
    });

    poller
        .run(Duration::from_secs(config.poll_interval))
        .await;

    serve.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_endpoint() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(tokio::spawn(async move {
            axum::serve(listener, routes().into_make_service()).await
        }));

        let client = reqwest::Client::new();
        let res = client.get(format!("http://{addr}/health")).send().await?;
        assert_eq!(res.status(), reqwest::StatusCode::OK);
        assert_eq!(res.text().await?, "OK");

        let res = client.get(format!("http://{addr}/nope")).send().await?;
        assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);
        Ok(())
    }
}
