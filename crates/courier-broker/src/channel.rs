// The broker-side delivery queue a client subscribes to, as seen by a connection.
use std::sync::atomic::{AtomicBool, Ordering};

pub trait Channel: Send + Sync {
    fn name(&self) -> &str;
    fn is_paused(&self) -> bool;
}

/// In-memory channel with only a name and a pause flag.
#[derive(Debug)]
pub struct ChannelHandle {
    name: String,
    paused: AtomicBool,
}

impl ChannelHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            paused: AtomicBool::new(false),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }
}

impl Channel for ChannelHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}
