//! Provider discovery.
//!
//! Two producers run side by side and feed the same stream of peers:
//! - the network-wide one periodically asks the routing layer for providers of the root block,
//! - the co-worker one periodically asks every peer currently worked with which other peers it knows about, which
//!   converges much faster once a swarm has formed.
//!
//! Both check the fetch scope before each blocking call and stop as soon as it is cancelled. Each producer owns a
//! sender of the stream, which is thus closed exactly once, when the last of them is dropped.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::dispatch::Shared;
use crate::PeerId;

pub(crate) fn spawn(shared: &Arc<Shared>, providers: mpsc::Sender<PeerId>) {
    shared.scope.spawn(network_wide(Arc::clone(shared), providers.clone()));
    shared.scope.spawn(co_workers(Arc::clone(shared), providers));
}

async fn network_wide(shared: Arc<Shared>, providers: mpsc::Sender<PeerId>) {
    let root = shared.root.id();

    while !shared.scope.is_cancelled() {
        let mut found = shared.network.routing.find_providers(root, shared.config.provider_limit);

        while let Some(peer) = found.next().await {
            tracing::trace!("Found provider {peer}");

            if shared.scope.is_cancelled() || providers.send(peer).await.is_err() {
                return;
            }
        }

        if !pause(&shared).await {
            break;
        }
    }

    tracing::debug!("Network-wide provider discovery stopped");
}

async fn co_workers(shared: Arc<Shared>, providers: mpsc::Sender<PeerId>) {
    let root = shared.root.id();

    while !shared.scope.is_cancelled() {
        for peer in shared.active_peers() {
            if shared.scope.is_cancelled() {
                return;
            }

            match shared.network.routing.find_providers_from(root, peer).await {
                Ok(found) => {
                    for co_worker in found {
                        tracing::trace!("Found co-worker {co_worker} from peer {peer}");

                        if providers.send(co_worker).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => tracing::debug!("Cannot get co-workers from peer {peer}: {err}"),
            }
        }

        if !pause(&shared).await {
            break;
        }
    }

    tracing::debug!("Co-worker discovery stopped");
}

/// Wait for the next discovery round, returning `false` if the scope got cancelled in the meantime.
async fn pause(shared: &Shared) -> bool {
    tokio::select! {
        _ = shared.scope.cancelled() => false,
        _ = tokio::time::sleep(shared.config.discovery_interval) => true,
    }
}
