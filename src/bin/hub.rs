use std::sync::Arc;

use clap::Parser;
use minerwatch::{
    config::read_config_file,
    notify::LogSink,
    rules::default_rules,
    scheduler::MonitorHandle,
    store::MemoryStore,
};
use tracing::{debug, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("minerwatch", LevelFilter::TRACE),
        ("hub", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();

    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let store = Arc::new(MemoryStore::new());

    // an empty rule store would make every cycle a no-op
    if store.rule_count().await == 0 {
        let rules = default_rules();
        debug!("seeding {} default alert rules", rules.len());
        for rule in rules {
            store.upsert_rule(rule).await;
        }
    }

    let handle = MonitorHandle::spawn(
        config,
        store.clone(),
        store.clone(),
        store.clone(),
        store,
        Arc::new(LogSink),
    );

    info!("minerwatch hub running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    handle.shutdown().await?;

    Ok(())
}
