use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cadenza_daemon::cli::Cli;
use cadenza_daemon::reactor::Reactor;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.no_timestamp);

    // Fork before the runtime exists; tokio does not survive a fork.
    if cli.fork {
        daemonize::Daemonize::new()
            .working_directory(".")
            .start()
            .context("daemonizing")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(run(cli))
}

fn init_tracing(debug: bool, no_timestamp: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if no_timestamp {
        builder.without_time().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    tracing::info!(config_dir = %cli.config_dir.display(), "cadenzad starting");

    let config =
        cadenza_domain::config::load(&cli.config_dir).context("loading configuration")?;
    tracing::info!(
        jobs = config.jobs.len(),
        data_dir = %config.data_dir.display(),
        "catalog loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let store = cadenza_store::open_store(&config).context("opening run store")?;
    tracing::info!("run store ready");

    // Runs that finished but could not be committed by a previous daemon.
    let replayed = cadenza_store::spool::replay(&config.data_dir.join("spool"), store.as_ref())
        .context("replaying spooled runs")?;
    if replayed > 0 {
        tracing::info!(replayed, "spooled runs committed");
    }

    // Rows a crashed daemon left in the running partition.
    let orphans = store
        .finalize_orphans(cadenza_store::ORPHAN_EXIT_CODE)
        .context("finalizing orphan runs")?;
    if !orphans.is_empty() {
        tracing::warn!(
            count = orphans.len(),
            "finalized orphan runs from a previous daemon"
        );
    }

    let (reactor, events_rx) = Reactor::new(config, cli.config_dir.clone(), store);
    reactor.run(events_rx).await.context("scheduler loop")?;
    Ok(())
}
