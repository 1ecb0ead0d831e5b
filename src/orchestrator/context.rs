use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use super::retry::RetryConfig;
use crate::capacity::{CapacityGate, StaticSubscription};
use crate::config::SmartFieldsConfig;
use crate::events::EventSender;

/// Everything a run needs besides the provider, built once and passed down.
///
/// Clones share the gate and the concurrency limit, so every note of a batch
/// draws from the same budget and the same pool of permits.
#[derive(Clone)]
pub struct GenerationContext {
    pub gate: Arc<CapacityGate>,
    pub concurrency: Arc<Semaphore>,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
    pub allow_empty_fields: bool,
    pub events: Option<EventSender>,
}

impl GenerationContext {
    pub fn new(gate: CapacityGate, max_concurrency: usize) -> Self {
        Self {
            gate: Arc::new(gate),
            concurrency: Arc::new(Semaphore::new(max_concurrency.max(1))),
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(60),
            allow_empty_fields: false,
            events: None,
        }
    }

    pub fn from_config(config: &SmartFieldsConfig) -> Self {
        let mut gate = CapacityGate::new(Arc::new(StaticSubscription::new(config.capacity.plan())));
        if let Some(rpm) = config.capacity.requests_per_minute {
            gate = gate.with_rate_window(rpm, Duration::from_secs(60));
        }
        Self {
            retry: config.retry(),
            request_timeout: config.request_timeout(),
            allow_empty_fields: config.allow_empty_fields,
            ..Self::new(gate, config.max_concurrency)
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_allow_empty_fields(mut self, allow: bool) -> Self {
        self.allow_empty_fields = allow;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }
}
