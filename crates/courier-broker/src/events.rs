// Single-slot, latest-wins hand-off from the command reader to the delivery pump.
use tokio::sync::watch;

/// Publishing side. Never blocks; an unread value is replaced by the next one.
#[derive(Debug)]
pub struct EventRelay<T> {
    tx: watch::Sender<Option<T>>,
}

/// Consuming side, held by the delivery pump.
#[derive(Debug)]
pub struct EventReceiver<T> {
    rx: watch::Receiver<Option<T>>,
}

/// Create a connected relay pair with nothing pending.
///
/// ```
/// use courier_broker::events::relay;
///
/// let (tx, mut rx) = relay();
/// tx.publish(1);
/// tx.publish(2);
/// assert_eq!(rx.try_recv(), Some(2));
/// assert_eq!(rx.try_recv(), None);
/// ```
pub fn relay<T>() -> (EventRelay<T>, EventReceiver<T>) {
    let (tx, rx) = watch::channel(None);
    (EventRelay { tx }, EventReceiver { rx })
}

impl<T> EventRelay<T> {
    pub fn publish(&self, value: T) {
        // Succeeds with or without a live receiver.
        self.tx.send_replace(Some(value));
    }
}

impl<T: Clone> EventReceiver<T> {
    /// Wait for a value published since the last one taken. `None` once the relay is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        if matches!(self.rx.has_changed(), Ok(true)) {
            self.rx.borrow_and_update().clone()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn latest_value_wins_and_is_seen_once() {
        let (tx, mut rx) = relay();
        tx.publish("first");
        tx.publish("second");
        assert_eq!(rx.recv().await, Some("second"));
        let pending = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn publish_without_receiver_does_not_fail() {
        let (tx, rx) = relay();
        drop(rx);
        tx.publish(7u32);
    }

    #[tokio::test]
    async fn recv_ends_when_relay_dropped() {
        let (tx, mut rx) = relay::<u8>();
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }
}
