//! `catalog-crawler` command line entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use catalog_crawler_lib::crawling::{JsonLinesSink, RecordSink, SchedulerConfig, StageScheduler};
use catalog_crawler_lib::infrastructure::logging::log_system_info;
use catalog_crawler_lib::infrastructure::{CrawlerConfig, HttpTransport, init_logging_with_config};
use catalog_crawler_lib::sites;

#[derive(Parser, Debug)]
#[command(name = "catalog-crawler", version, about = "Crawl a retailer catalog into JSON lines")]
struct Cli {
    /// Site profile to crawl (see --list-sites)
    #[arg(short, long)]
    site: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output file; records go to stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Upper bound on concurrent fetches
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Print the registered site ids and exit
    #[arg(long)]
    list_sites: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.list_sites {
        for id in sites::SITE_IDS {
            println!("{id}");
        }
        return Ok(());
    }

    let mut config = CrawlerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(site) = cli.site {
        config = config.with_site(site);
    }
    if let Some(output) = cli.output {
        config = config.with_output(output);
    }
    if let Some(max_in_flight) = cli.max_in_flight {
        config = config.with_max_in_flight(max_in_flight);
    }
    config.validate()?;

    init_logging_with_config(&config.logging)?;
    log_system_info(&config.logging);

    if config.site.is_empty() {
        anyhow::bail!("No site selected; pass --site or set CATALOG_CRAWLER_SITE");
    }
    let profile = Arc::new(sites::profile(&config.site)?);
    let transport = Arc::new(HttpTransport::new(config.http.clone())?);
    let sink: Arc<dyn RecordSink> = match &config.output {
        Some(path) => {
            info!("💾 Writing records to {}", path.display());
            Arc::new(JsonLinesSink::create(path)?)
        }
        None => Arc::new(JsonLinesSink::new(std::io::stdout())),
    };

    let scheduler = StageScheduler::new(profile, transport, sink, SchedulerConfig::from(&config));
    let token = scheduler.cancellation_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("🛑 Interrupt received, draining in-flight fetches");
                token.cancel();
            }
            Err(e) => error!("Could not listen for Ctrl-C: {e}"),
        }
    });

    info!("🚀 Crawling '{}'", config.site);
    let report = scheduler.run().await?;
    eprintln!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
