// Lock-free flow-control counters shared by the command reader and the delivery pump.
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Point-in-time view of the gating counters, taken with independent loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub ready: i64,
    pub last_ready: i64,
    pub in_flight: i64,
}

impl Readiness {
    /// In-flight is held against the last ready count the client set, not the live one,
    /// so lowering RDY mid-flight does not revoke messages already committed to.
    ///
    /// ```
    /// use courier_broker::counters::Readiness;
    ///
    /// let state = Readiness { ready: 2, last_ready: 5, in_flight: 3 };
    /// assert!(state.allows_delivery());
    /// assert!(!Readiness { ready: 0, ..state }.allows_delivery());
    /// ```
    pub fn allows_delivery(&self) -> bool {
        self.in_flight < self.last_ready && self.ready > 0
    }
}

#[derive(Debug, Default)]
pub struct FlowCounters {
    ready: AtomicI64,
    last_ready: AtomicI64,
    in_flight: AtomicI64,
    messages: AtomicU64,
    finished: AtomicU64,
    requeued: AtomicU64,
    wakeup: Notify,
}

impl FlowCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready_count(&self, count: i64) {
        self.ready.store(count, Ordering::Release);
        self.last_ready.store(count, Ordering::Release);
        self.wake();
    }

    /// Account for one message handed to the client. Readiness must already be confirmed.
    pub fn sending_message(&self) {
        self.ready.fetch_sub(1, Ordering::AcqRel);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finished_message(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.wake();
    }

    pub fn timed_out_message(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.wake();
    }

    pub fn requeued_message(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.wake();
    }

    /// Drop all in-flight accounting, e.g. when the channel lets go of this client.
    pub fn empty(&self) {
        self.in_flight.store(0, Ordering::Release);
        self.wake();
    }

    pub fn readiness(&self) -> Readiness {
        Readiness {
            ready: self.ready.load(Ordering::Acquire),
            last_ready: self.last_ready.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }

    pub fn ready_count(&self) -> i64 {
        self.ready.load(Ordering::Acquire)
    }

    pub fn in_flight_count(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn message_count(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn finish_count(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    pub fn requeue_count(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    // At most one wakeup is stored; extra signals collapse into it.
    pub(crate) fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// Resolves once something may have changed readiness. Callers re-read the counters.
    pub async fn changed(&self) {
        self.wakeup.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn readiness_truth_table() {
        for ready in -2..=3 {
            for last_ready in -1..=3 {
                for in_flight in 0..=4 {
                    let state = Readiness {
                        ready,
                        last_ready,
                        in_flight,
                    };
                    assert_eq!(
                        state.allows_delivery(),
                        in_flight < last_ready && ready > 0,
                        "{state:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn set_ready_count_gates_delivery() {
        let counters = FlowCounters::new();
        counters.set_ready_count(4);
        assert!(counters.readiness().allows_delivery());

        counters.set_ready_count(0);
        assert!(!counters.readiness().allows_delivery());
        counters.empty();
        assert!(!counters.readiness().allows_delivery());
    }

    #[test]
    fn sending_and_settling_move_counters_by_one() {
        let counters = FlowCounters::new();
        counters.set_ready_count(10);
        for _ in 0..3 {
            counters.sending_message();
        }
        assert_eq!(counters.ready_count(), 7);
        assert_eq!(counters.in_flight_count(), 3);
        assert_eq!(counters.message_count(), 3);

        counters.finished_message();
        counters.requeued_message();
        counters.timed_out_message();
        assert_eq!(counters.in_flight_count(), 0);
        assert_eq!(counters.ready_count(), 7);
        assert_eq!(counters.finish_count(), 1);
        assert_eq!(counters.requeue_count(), 1);
        assert_eq!(counters.message_count(), 3);
    }

    #[test]
    fn exhausted_ready_count_stays_closed_after_finish() {
        let counters = FlowCounters::new();
        counters.set_ready_count(10);
        for _ in 0..10 {
            assert!(counters.readiness().allows_delivery());
            counters.sending_message();
        }
        assert!(!counters.readiness().allows_delivery());

        counters.finished_message();
        assert_eq!(counters.in_flight_count(), 9);
        assert!(!counters.readiness().allows_delivery());

        // In-flight is still 9, so a budget of 9 admits nothing new.
        counters.set_ready_count(9);
        assert!(!counters.readiness().allows_delivery());
        counters.set_ready_count(10);
        assert!(counters.readiness().allows_delivery());
    }

    #[tokio::test]
    async fn wakeups_collapse_into_one_pending_signal() {
        let counters = FlowCounters::new();
        counters.finished_message();
        counters.requeued_message();
        counters.set_ready_count(1);

        tokio::time::timeout(Duration::from_millis(100), counters.changed())
            .await
            .expect("pending wakeup");
        let second = tokio::time::timeout(Duration::from_millis(50), counters.changed()).await;
        assert!(second.is_err(), "only one wakeup is stored");
    }
}
