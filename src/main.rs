use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use virtual_router::{Manager, MemoryInterfaceFactory, TopologyConfig};

#[derive(Parser)]
#[command(name = "virtual-router", about = "Link-state routing over a simulated fabric")]
struct Cli {
    /// Topology file (JSON). Without one, a chain of `--routers` routers is built.
    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value_t = 2)]
    routers: usize,

    /// Overrides the hello interval of the topology.
    #[arg(long)]
    hello_ms: Option<u64>,

    /// Stop after this many seconds; 0 runs until Ctrl-C.
    #[arg(long, default_value_t = 0)]
    run_secs: u64,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut topology = match &cli.config {
        Some(path) => TopologyConfig::load(path)?,
        None => TopologyConfig::chain(cli.routers),
    };
    if let Some(hello_ms) = cli.hello_ms {
        topology.protocol.hello_interval_ms = hello_ms;
        topology.protocol.dead_interval_ms = hello_ms * 4;
    }
    topology.protocol.validate()?;

    let rt = Builder::new_multi_thread().enable_all().build()?;

    rt.block_on(async {
        let factory = Arc::new(MemoryInterfaceFactory::new(topology.protocol.inject_queue_depth));
        let manager = Manager::new(topology.protocol.clone(), factory);

        let mut events = manager.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!("Failed to encode event: {}", e),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!("Event printer skipped {} events", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        for spec in &topology.routers {
            manager
                .create_and_start_router(spec.id.clone(), spec.interface_name.clone(), spec.network, spec.mtu)
                .await
                .with_context(|| format!("creating router {:?}", spec.id))?;
        }
        for link in &topology.connections {
            let metric = link.metric.unwrap_or(topology.protocol.default_link_metric);
            manager
                .add_connection_with_metric(&link.a, &link.b, metric)
                .await
                .with_context(|| format!("connecting {} and {}", link.a, link.b))?;
        }
        info!(
            "Topology up: {} routers, {} connections",
            topology.routers.len(),
            topology.connections.len()
        );

        if cli.run_secs > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(cli.run_secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        } else {
            tokio::signal::ctrl_c().await?;
        }

        for router in manager.list_routers().await {
            info!(
                "{} {} ({}) routes={} full={:?}",
                router.id, router.address, router.interface_name, router.route_count, router.full_neighbors
            );
        }
        manager.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}
