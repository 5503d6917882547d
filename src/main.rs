use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Notify;

use pricewatch::config::Config;
use pricewatch::extract::Extractor;
use pricewatch::fetch::Fetcher;
use pricewatch::notify::{LogNotifier, Notifier, WebhookNotifier};
use pricewatch::proxy::ProxyRotator;
use pricewatch::reconcile::{Reconciler, Scheduler};
use pricewatch::repository::{EntityRepository, SqliteRepository};
use pricewatch::service::PriceAgent;
use pricewatch::{http, logging};

#[derive(Parser, Debug)]
#[command(name = "pricewatch", about = "Tracks geizhals.de wishlists and products and reports price changes")]
struct Args {
    /// TOML configuration file; built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single reconciliation pass and exit.
    #[arg(long)]
    once: bool,

    /// Run only the scheduler, without the HTTP adapter.
    #[arg(long)]
    no_http: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load_or_default(args.config.as_deref())?;
    logging::init(&config.logging);

    // -------------------------
    // Wiring
    // -------------------------

    let repo: Arc<dyn EntityRepository> = Arc::new(
        SqliteRepository::connect(&config.database.url)
            .await
            .with_context(|| format!("failed to open database {}", config.database.url))?,
    );

    let endpoints = config.proxy.resolve_endpoints()?;
    let proxies = (!endpoints.is_empty()).then(|| Arc::new(ProxyRotator::shuffled(endpoints)));
    let fetcher = Fetcher::new(config.fetch.clone(), proxies).context("failed to build http client")?;
    let extractor = Arc::new(Extractor::new(Arc::new(fetcher)));

    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url.clone(), config.fetch.timeout()).context("failed to build webhook client")?,
        ),
        None => Arc::new(LogNotifier),
    };

    let reconciler = Arc::new(Reconciler::new(
        repo.clone(),
        extractor.clone(),
        notifier,
        config.reconcile.concurrency,
    ));

    if args.once {
        let report = reconciler.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    // -------------------------
    // Run
    // -------------------------

    let shutdown = Arc::new(Notify::new());
    let scheduler = Scheduler::new(reconciler.clone(), config.reconcile.interval()).start(shutdown.clone());

    if args.no_http {
        tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    } else {
        let agent = Arc::new(PriceAgent::new(repo, extractor, config.limits));
        // The server stops on ctrl-c by itself.
        http::serve(&config.http.bind, agent, reconciler)
            .await
            .with_context(|| format!("http adapter on {} failed", config.http.bind))?;
    }

    tracing::info!("shutting down");
    shutdown.notify_one();
    scheduler.await.context("scheduler task panicked")?;
    Ok(())
}
