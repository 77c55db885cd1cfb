//! # Network Observer
//!
//! Holds the latest connectivity snapshot for the streaming core. The host
//! either pushes updates with [`NetworkObserver::update`] or hands over a
//! [`NetworkMonitor`] whose change stream is consumed by a background watcher.

use bridge_traits::{NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
use core_runtime::events::{CoreEvent, EventBus, NetworkEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connectivity as seen by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub connected: bool,
    pub network_type: Option<NetworkType>,
}

impl NetworkState {
    pub fn online(network_type: NetworkType) -> Self {
        Self {
            connected: true,
            network_type: Some(network_type),
        }
    }

    pub fn offline() -> Self {
        Self {
            connected: false,
            network_type: None,
        }
    }

    /// Assumed connected with an unknown transport, used before the first probe.
    pub fn unknown() -> Self {
        Self {
            connected: true,
            network_type: None,
        }
    }

    pub fn is_cellular(&self) -> bool {
        self.connected && self.network_type == Some(NetworkType::Cellular)
    }
}

impl From<&NetworkInfo> for NetworkState {
    fn from(info: &NetworkInfo) -> Self {
        // Only a definite disconnect blocks fetches.
        let connected = info.status != NetworkStatus::Disconnected;
        Self {
            connected,
            network_type: if connected { info.network_type } else { None },
        }
    }
}

/// Cloneable handle to the shared connectivity snapshot.
#[derive(Clone)]
pub struct NetworkObserver {
    state: Arc<watch::Sender<NetworkState>>,
    monitor: Option<Arc<dyn NetworkMonitor>>,
    event_bus: Option<EventBus>,
}

impl NetworkObserver {
    /// Observer backed by a host monitor. Starts as [`NetworkState::unknown`]
    /// until [`refresh`](Self::refresh) runs.
    pub fn new(monitor: Option<Arc<dyn NetworkMonitor>>) -> Self {
        let (tx, _) = watch::channel(NetworkState::unknown());
        Self {
            state: Arc::new(tx),
            monitor,
            event_bus: None,
        }
    }

    /// Observer that only changes through [`update`](Self::update).
    pub fn fixed(state: NetworkState) -> Self {
        let (tx, _) = watch::channel(state);
        Self {
            state: Arc::new(tx),
            monitor: None,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn latest(&self) -> NetworkState {
        *self.state.borrow()
    }

    /// Replace the snapshot. Returns `true` if it changed.
    pub fn update(&self, next: NetworkState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });

        if changed {
            info!(
                connected = next.connected,
                network_type = next.network_type.map(|t| t.as_str()),
                "Network state changed"
            );
            if let Some(bus) = &self.event_bus {
                bus.emit(CoreEvent::Network(NetworkEvent::StatusChanged {
                    connected: next.connected,
                    network_type: next.network_type.map(|t| t.as_str().to_string()),
                }))
                .ok();
            }
        }
        changed
    }

    /// Query the monitor once. Monitor errors keep the previous snapshot.
    pub async fn refresh(&self) -> NetworkState {
        if let Some(monitor) = &self.monitor {
            match monitor.get_network_info().await {
                Ok(info) => {
                    self.update(NetworkState::from(&info));
                }
                Err(e) => warn!(error = %e, "Network probe failed; keeping last state"),
            }
        }
        self.latest()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }

    /// Consume the monitor's change stream until `shutdown` fires.
    ///
    /// Returns `None` when there is no monitor or no runtime to run on.
    pub fn spawn_watcher(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let monitor = self.monitor.clone()?;
        let Ok(runtime) = Handle::try_current() else {
            warn!("No async runtime available; network watcher not started");
            return None;
        };
        let observer = self.clone();

        Some(runtime.spawn(async move {
            let mut changes = match monitor.subscribe_changes().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Network change subscription unavailable");
                    return;
                }
            };
            // Pick up anything that changed before the subscription existed.
            observer.refresh().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = changes.next() => match next {
                        Some(info) => {
                            observer.update(NetworkState::from(&info));
                        }
                        None => break,
                    },
                }
            }
            debug!("Network watcher stopped");
        }))
    }
}

impl std::fmt::Debug for NetworkObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkObserver")
            .field("state", &self.latest())
            .field("has_monitor", &self.monitor.is_some())
            .finish()
    }
}
