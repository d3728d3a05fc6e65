use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use evcat_adapters::AdapterContext;
use evcat_storage::{FileGateway, HttpClient, MemoryGateway, PersistenceGateway, PgGateway};
use evcat_sync::{
    build_scheduler, report_markdown, summary_markdown, write_run, CatalogConfig, CollectionCycle,
    CycleRunner, LocationConfig, PersistenceConfig, RuleEnrichmentHook,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "evcat")]
#[command(about = "Event catalog collection and deduplication")]
struct Cli {
    /// Catalog configuration file.
    #[arg(long, global = true, default_value = "catalog.yaml")]
    config: PathBuf,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection cycle and write its report.
    Collect(CollectArgs),
    /// List configured sources.
    Sources,
    /// Apply database migrations.
    Migrate,
    /// Run collection cycles on the configured cron schedule until interrupted.
    Schedule,
    /// Summarize recent runs.
    Report {
        #[arg(long, default_value_t = 10)]
        runs: usize,
    },
}

#[derive(Debug, Default, Args)]
struct CollectArgs {
    /// `City,Country` or `City,State,Country`. Repeatable; defaults to the configured locations.
    #[arg(long = "location", value_parser = parse_location)]
    locations: Vec<LocationConfig>,
    /// Restrict the cycle to these sources. Repeatable.
    #[arg(long = "source")]
    sources: Vec<String>,
}

fn parse_location(value: &str) -> Result<LocationConfig, String> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(format!("empty component in location {value:?}"));
    }
    match parts.as_slice() {
        [city, country] => Ok(LocationConfig::new(*city, *country)),
        [city, state, country] => Ok(LocationConfig {
            state: Some(state.to_string()),
            ..LocationConfig::new(*city, *country)
        }),
        _ => Err(format!("expected City,Country or City,State,Country, got {value:?}")),
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let directive = if verbose { "evcat=debug" } else { "evcat=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();
    Ok(())
}

async fn open_gateway(config: &CatalogConfig) -> Result<Arc<dyn PersistenceGateway>> {
    let gateway: Arc<dyn PersistenceGateway> = match &config.persistence {
        PersistenceConfig::Memory => Arc::new(MemoryGateway::new()),
        PersistenceConfig::File { root } => Arc::new(FileGateway::new(config.resolve(root))),
        PersistenceConfig::Postgres { database_url } => {
            let gateway = PgGateway::connect(database_url)
                .await
                .context("connecting to postgres")?;
            gateway.migrate().await.context("running migrations")?;
            Arc::new(gateway)
        }
    };
    info!(persistence = config.persistence.label(), "persistence gateway ready");
    Ok(gateway)
}

async fn build_cycle(config: &CatalogConfig) -> Result<CollectionCycle> {
    let http = HttpClient::new(config.http.client_config())?;
    let ctx = AdapterContext::new(http, config.base_dir.clone());
    let gateway = open_gateway(config).await?;
    let rules = RuleEnrichmentHook::load_or_builtin(&config.rules_path())?;
    Ok(CollectionCycle::from_config(config, &ctx, gateway)?.with_enrichment(Arc::new(rules)))
}

async fn collect(config: &CatalogConfig, args: CollectArgs) -> Result<()> {
    let locations = if args.locations.is_empty() {
        config.locations.clone()
    } else {
        args.locations
    };
    if locations.is_empty() {
        bail!("no locations given and none configured");
    }

    let cycle = build_cycle(config).await?;
    let sources = cycle.select_sources(&args.sources)?;
    let run = cycle.run_detailed(&locations, &sources).await?;
    let artifacts = write_run(&config.reports_path(), &run).await?;

    print!("{}", summary_markdown(&run.report));
    println!(
        "collect complete: run_id={} records={} failed_sources={} report={}",
        run.report.run_id,
        run.report.records_fetched,
        run.report.source_failures.len(),
        artifacts.dir.display()
    );
    Ok(())
}

fn list_sources(config: &CatalogConfig) {
    for source in &config.sources {
        println!(
            "{:<20} {:<8} {:<9} priority={} confidence={:.2} rate={}/{:.1}s",
            source.name,
            source.kind.label(),
            if source.enabled { "enabled" } else { "disabled" },
            source.priority,
            source.confidence,
            source.rate_limit.capacity,
            source.rate_limit.refill_per_second
        );
    }
}

async fn migrate(config: &CatalogConfig) -> Result<()> {
    let PersistenceConfig::Postgres { database_url } = &config.persistence else {
        bail!(
            "migrate needs postgres persistence, configured: {}",
            config.persistence.label()
        );
    };
    let gateway = PgGateway::connect(database_url)
        .await
        .context("connecting to postgres")?;
    gateway.migrate().await.context("running migrations")?;
    println!("migrations applied");
    Ok(())
}

async fn schedule(config: &CatalogConfig) -> Result<()> {
    if config.locations.is_empty() {
        bail!("scheduled cycles need at least one configured location");
    }
    let cycle = Arc::new(build_cycle(config).await?);
    let runner = Arc::new(CycleRunner::new(
        cycle,
        config.locations.clone(),
        config.reports_path(),
    ));
    let mut sched = build_scheduler(&config.schedule.crons, runner).await?;
    sched.start().await.context("starting scheduler")?;
    info!(crons = ?config.schedule.crons, "scheduler running, ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    let config = CatalogConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Collect(CollectArgs::default())) {
        Commands::Collect(args) => collect(&config, args).await?,
        Commands::Sources => list_sources(&config),
        Commands::Migrate => migrate(&config).await?,
        Commands::Schedule => schedule(&config).await?,
        Commands::Report { runs } => print!("{}", report_markdown(&config.reports_path(), runs)?),
    }

    Ok(())
}
