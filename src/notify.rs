use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::BusyChange;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for busy-flag changes, per charger and for all chargers.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<BusyChange>>,
    all: broadcast::Sender<BusyChange>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to changes on one charger. Creates the channel if needed.
    pub fn subscribe(&self, charger_id: &str) -> broadcast::Receiver<BusyChange> {
        let sender = self
            .channels
            .entry(charger_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to changes on every charger.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BusyChange> {
        self.all.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, change: &BusyChange) {
        if let Some(sender) = self.channels.get(&change.charger_id) {
            let _ = sender.send(change.clone());
        }
        let _ = self.all.send(change.clone());
    }

    /// Drop channels nobody listens to any more.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(charger: &str, busy: bool, revision: u64) -> BusyChange {
        BusyChange {
            charger_id: charger.into(),
            busy,
            revision,
            at: 0,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("C1");
        let mut all = hub.subscribe_all();

        hub.send(&change("C1", true, 1));
        hub.send(&change("C2", true, 2));

        assert_eq!(rx.recv().await.unwrap(), change("C1", true, 1));
        assert!(rx.try_recv().is_err());
        assert_eq!(all.recv().await.unwrap().charger_id, "C1");
        assert_eq!(all.recv().await.unwrap().charger_id, "C2");
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber, should not panic
        hub.send(&change("C1", false, 3));
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let keep = hub.subscribe("C1");
        drop(hub.subscribe("C2"));
        assert_eq!(hub.channel_count(), 2);
        hub.prune();
        assert_eq!(hub.channel_count(), 1);
        drop(keep);
    }
}
