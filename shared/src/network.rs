use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkTransition {
    Online,
    Offline,
}

impl NetworkTransition {
    fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

/// Current connectivity as reported by the platform shell.
///
/// Cheap to clone; every clone shares the same state.
#[derive(Clone, Debug)]
pub struct NetworkStatusMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkStatusMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    /// Record the platform's signal. Returns true if the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Network status changed");
        }
        changed
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> NetworkSubscription {
        NetworkSubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Forward a platform connectivity stream into the monitor until it ends.
    pub fn attach<S>(&self, stream: S) -> JoinHandle<()>
    where
        S: Stream<Item = bool> + Send + 'static,
    {
        let monitor = self.clone();
        tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(online) = stream.next().await {
                monitor.set_online(online);
            }
            debug!("Network status stream ended");
        })
    }
}

/// Receiver side of [`NetworkStatusMonitor`].
///
/// Rapid flips between polls are coalesced: the subscriber observes the
/// latest state, never a stale one.
#[derive(Debug)]
pub struct NetworkSubscription {
    rx: watch::Receiver<bool>,
}

impl NetworkSubscription {
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the next change. `None` once every monitor handle is gone.
    pub async fn next_transition(&mut self) -> Option<NetworkTransition> {
        self.rx.changed().await.ok()?;
        let online = *self.rx.borrow_and_update();
        Some(NetworkTransition::from_online(online))
    }
}
