mod cli;
mod deltas;
mod error;
mod ignore;
mod kubernetes;
mod logs;
mod orchestrator;
mod redact;
mod session;
mod shutdown;
mod store;
mod types;
mod utils;

use anyhow::Context;
use clap::Parser;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use cli::{Cli, Command, DeltasArgs, FindArgs, RecordArgs};
use deltas::{DeltaOptions, DeltaReport};
use kubernetes::KubeCluster;
use orchestrator::{RecordOptions, SkipList};
use shutdown::{Shutdown, ShutdownCause, TaskRegistry};
use store::{SnapshotStore, format_timestamp};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Record(args) => run_record(args).await,
        Command::Deltas(args) => run_deltas(args),
        Command::Find(args) => run_find(args),
    };
    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_record(args: RecordArgs) -> anyhow::Result<()> {
    if args.disable_resource_recording && !args.with_logs {
        anyhow::bail!("--disable-resource-recording is only meaningful with --with-logs");
    }
    let ignore_rules = match &args.ignore_log_lines_file {
        Some(path) => ignore::load_rules(path)?,
        None => Vec::new(),
    };

    let (cluster, host) = KubeCluster::connect(args.context.as_deref()).await?;
    let store = Arc::new(SnapshotStore::new(&args.output_dir, &host));
    let shutdown = Shutdown::new();
    let options = RecordOptions {
        record_resources: !args.disable_resource_recording,
        with_logs: args.with_logs,
        ignore_rules,
        log_lookback_seconds: args.log_lookback_seconds,
    };

    let mut handle = orchestrator::start(
        Arc::new(cluster),
        store,
        &SkipList::default(),
        options,
        shutdown.clone(),
    )
    .await?;
    let registry = handle.registry();
    spawn_interrupt_handler(shutdown.clone(), registry.clone());

    let grace = Duration::from_secs(args.shutdown_grace_seconds);
    let finished = handle.wait();
    tokio::pin!(finished);
    tokio::select! {
        _ = &mut finished => {}
        _ = shutdown.cancelled() => {
            if tokio::time::timeout(grace, &mut finished).await.is_err() {
                warn!("Tasks still running {}s after shutdown was requested", grace.as_secs());
                dump_running(&registry);
                std::process::exit(1);
            }
        }
    }

    match shutdown.cause() {
        Some(ShutdownCause::Fatal(msg)) => anyhow::bail!("Recording aborted: {}", msg),
        Some(ShutdownCause::Interrupted) => info!("Recording stopped"),
        None => info!("All watches closed, recording finished"),
    }
    Ok(())
}

/// The first interrupt asks every task to stop. Another one exits right away.
fn spawn_interrupt_handler(shutdown: Shutdown, registry: TaskRegistry) {
    tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            received += 1;
            if received == 1 {
                info!("Received interrupt, stopping (press ctrl-c again to exit immediately)");
                shutdown.trigger(ShutdownCause::Interrupted);
            } else {
                warn!("Received another interrupt, exiting");
                dump_running(&registry);
                std::process::exit(130);
            }
        }
    });
}

fn dump_running(registry: &TaskRegistry) {
    for label in registry.running() {
        warn!("Still running: {}", label);
    }
}

fn run_deltas(args: DeltasArgs) -> anyhow::Result<()> {
    let options = DeltaOptions {
        skip: args.skip,
        only: args.only,
        skip_initial: args.skip_initial,
    };
    let reports = deltas::compute_deltas(&args.dir, &options)?;
    let color = !args.no_color && std::io::stdout().is_terminal();
    for report in &reports {
        match report {
            DeltaReport::Unchanged {
                path,
                before,
                after,
            } => debug!(
                "No changes in {} between {} and {}",
                path,
                format_timestamp(*before),
                format_timestamp(*after)
            ),
            DeltaReport::Failed { path, file, error } => {
                error!("Cannot show {} ({}): {}", path, file.display(), error)
            }
            _ => {
                if let Some(text) = deltas::render(report, color) {
                    println!("{}", text);
                }
            }
        }
    }
    Ok(())
}

fn run_find(args: FindArgs) -> anyhow::Result<()> {
    if !args.dir.is_dir() {
        anyhow::bail!("{} is not a directory", args.dir.display());
    }
    let store = SnapshotStore::open(&args.dir);
    let records = store
        .find_by_name_substring(&args.name)
        .with_context(|| format!("Failed to search {}", args.dir.display()))?;
    if records.is_empty() {
        info!(
            "No records of objects matching {:?} in {}",
            args.name,
            store.root().display()
        );
    }
    for record in &records {
        println!(
            "{}/{}/{}{}",
            record.host,
            record.key,
            format_timestamp(record.captured_at),
            record.kind.suffix()
        );
        if args.content {
            println!("{}", record.payload.trim_end());
        }
    }
    Ok(())
}
