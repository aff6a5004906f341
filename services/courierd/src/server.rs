// Shared state handed to every connection task.
use anyhow::Result;
use courier_broker::{ChannelHandle, ClientContext, ReadinessLog, TracingReadinessLog};
use courier_common::ids::ClientIdSequence;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::BrokerConfig;

/// Channels known to this process, keyed by `topic:channel`.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Arc<ChannelHandle>>>,
}

impl ChannelRegistry {
    /// Return the channel for `topic`/`channel`, creating it on first use.
    pub fn get_or_create(&self, topic: &str, channel: &str) -> Arc<ChannelHandle> {
        let key = format!("{topic}:{channel}");
        let mut channels = self.channels.lock();
        if let Some(existing) = channels.get(&key) {
            return Arc::clone(existing);
        }
        tracing::info!(channel = %key, "channel created");
        let handle = Arc::new(ChannelHandle::new(key.clone()));
        channels.insert(key, Arc::clone(&handle));
        handle
    }

    pub fn get(&self, topic: &str, channel: &str) -> Option<Arc<ChannelHandle>> {
        self.channels
            .lock()
            .get(&format!("{topic}:{channel}"))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ServerState {
    pub context: Arc<ClientContext>,
    pub channels: ChannelRegistry,
    pub ids: ClientIdSequence,
    pub max_body_bytes: usize,
}

impl ServerState {
    pub fn new(context: ClientContext, max_body_bytes: usize) -> Self {
        Self {
            context: Arc::new(context),
            channels: ChannelRegistry::default(),
            ids: ClientIdSequence::default(),
            max_body_bytes,
        }
    }

    /// Build the per-connection context from daemon configuration.
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        let readiness_log: Arc<dyn ReadinessLog> = Arc::new(TracingReadinessLog {
            verbose: config.verbose,
        });
        let context = ClientContext {
            limits: config.session_limits()?,
            tls: config.tls_acceptor()?,
            transport: config.transport_config(),
            readiness_log,
        };
        Ok(Self::new(context, config.max_body_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_broker::Channel;

    #[test]
    fn registry_reuses_channels() {
        let registry = ChannelRegistry::default();
        assert!(registry.is_empty());
        let first = registry.get_or_create("orders", "billing");
        let again = registry.get_or_create("orders", "billing");
        let other = registry.get_or_create("orders", "audit");
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(first.name(), "orders:billing");
        assert_eq!(registry.len(), 2);
        assert!(registry.get("orders", "missing").is_none());
    }
}
