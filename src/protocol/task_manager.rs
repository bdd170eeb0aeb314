use log::{debug, info, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, interval_at, sleep};
use crate::RouterId;
use super::message_handler;
use super::neighbor::AdjacencyState;
use super::router::{InboundFrame, Router};

pub fn start_tasks(
    router: &Arc<Router>,
    inject_rx: mpsc::Receiver<InboundFrame>,
    spf_rx: mpsc::Receiver<()>,
) -> Vec<JoinHandle<()>> {
    let shutdown_rx = router.subscribe_shutdown();

    // Start read task
    let read_handle = {
        let router = router.clone();
        let shutdown_rx = shutdown_rx.resubscribe();
        tokio::spawn(async move { read_task(router, inject_rx, shutdown_rx).await })
    };

    // Start hello task
    let hello_handle = {
        let router = router.clone();
        let shutdown_rx = shutdown_rx.resubscribe();
        tokio::spawn(async move { hello_task(router, shutdown_rx).await })
    };

    // Start aging task
    let aging_handle = {
        let router = router.clone();
        let shutdown_rx = shutdown_rx.resubscribe();
        tokio::spawn(async move { aging_task(router, shutdown_rx).await })
    };

    // Start SPF task
    let spf_handle = {
        let router = router.clone();
        tokio::spawn(async move { spf_task(router, spf_rx, shutdown_rx).await })
    };

    debug!("Router {} protocol tasks started", router.id());
    vec![read_handle, hello_handle, aging_handle, spf_handle]
}

async fn read_task(
    router: Arc<Router>,
    mut inject_rx: mpsc::Receiver<InboundFrame>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interface_open = true;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Router {} read task shutting down", router.id());
                break;
            }
            frame = router.interface().read_frame(), if interface_open => {
                match frame {
                    Some(frame) => message_handler::handle_frame(&router, frame, None).await,
                    None => {
                        warn!("Router {} interface {} closed underneath it", router.id(), router.interface_name());
                        interface_open = false;
                    }
                }
            }
            inbound = inject_rx.recv() => {
                let Some(InboundFrame { frame, from }) = inbound else {
                    break;
                };
                message_handler::handle_frame(&router, frame, Some(&from)).await;
            }
        }
    }
}

async fn hello_task(router: Arc<Router>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = interval(router.config().hello_interval());

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Router {} hello task shutting down", router.id());
                break;
            }
            _ = interval.tick() => {
                expire_dead_neighbors(&router).await;
                send_hello_messages(&router).await;
            }
        }
    }
}

async fn expire_dead_neighbors(router: &Router) {
    let expired = {
        let mut state = router.state().write().await;
        state
            .neighbors
            .expire(Instant::now(), router.config().dead_interval())
    };

    let mut lost_adjacency = false;
    for (peer_id, previous) in &expired {
        warn!(
            "Router {} neighbor {} hello timeout ({:?} -> Down)",
            router.id(),
            peer_id,
            previous
        );
        lost_adjacency |= *previous >= AdjacencyState::TwoWay;
    }

    if lost_adjacency {
        router.reoriginate().await;
    }
}

async fn send_hello_messages(router: &Router) {
    let peers: Vec<(RouterId, Ipv4Addr)> = {
        let state = router.state().read().await;
        state
            .neighbors
            .iter()
            .map(|n| (n.peer_router_id.clone(), n.peer_address))
            .collect()
    };

    for (peer_id, address) in peers {
        router.send_hello(&peer_id, address).await;
    }
}

async fn aging_task(router: Arc<Router>, mut shutdown_rx: broadcast::Receiver<()>) {
    let config = router.config().clone();
    let mut aging = interval(config.aging_interval());
    let mut refresh = interval_at(
        Instant::now() + config.lsu_refresh_interval(),
        config.lsu_refresh_interval(),
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Router {} aging task shutting down", router.id());
                break;
            }
            _ = aging.tick() => {
                let purged = {
                    let mut state = router.state().write().await;
                    state.lsdb.purge_expired(router.id(), Instant::now(), config.lsa_max_age())
                };
                if !purged.is_empty() {
                    info!("Router {} aged out LSUs from {:?}", router.id(), purged);
                    router.schedule_spf();
                }
            }
            _ = refresh.tick() => {
                let update = router.originate_lsu().await;
                router.flood(&update, None).await;
            }
        }
    }
}

async fn spf_task(
    router: Arc<Router>,
    mut spf_rx: mpsc::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let delay = router.config().spf_delay();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Router {} SPF task shutting down", router.id());
                break;
            }
            trigger = spf_rx.recv() => {
                if trigger.is_none() {
                    break;
                }
                // Let a burst of database changes settle first
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sleep(delay) => {}
                }
                while spf_rx.try_recv().is_ok() {}

                router.compute_shortest_paths().await;
            }
        }
    }
}
