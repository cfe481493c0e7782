//! Online/offline signal
//!
//! The host platform reports network changes through [`Connectivity`];
//! the orchestrator subscribes and treats every offline → online transition
//! as a sync trigger.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Connectivity {
    sender: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self { sender }
    }

    /// Report the current network state. Repeating the current state does not
    /// notify subscribers.
    pub fn set_online(&self, online: bool) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_notify_subscribers() {
        let connectivity = Connectivity::new(false);
        let mut receiver = connectivity.subscribe();
        assert!(!connectivity.is_online());

        connectivity.set_online(false);
        assert!(!receiver.has_changed().unwrap());

        connectivity.set_online(true);
        receiver.changed().await.unwrap();
        assert!(*receiver.borrow_and_update());
        assert!(connectivity.is_online());
    }

    #[test]
    fn test_clones_share_state() {
        let connectivity = Connectivity::default();
        let handle = connectivity.clone();
        handle.set_online(false);
        assert!(!connectivity.is_online());
    }
}
