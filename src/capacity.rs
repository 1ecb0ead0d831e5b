//! Admission control for provider calls.
//!
//! The [`CapacityGate`] reads the user's plan from a [`SubscriptionSource`]
//! and counts what this process has consumed against it. Denial is immediate;
//! nothing queues behind an exhausted budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::field::FieldKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CapacityError {
    #[error("{0} credits exhausted")]
    CreditsExhausted(FieldKind),

    #[error("rate limit of {limit} requests per window reached")]
    RateWindow { limit: u32 },
}

/// Credit usage of the current plan. A `None` capacity is unlimited, which is
/// the case for users calling providers with their own API key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanInfo {
    pub plan_id: String,
    pub text_credits_used: u64,
    pub text_credits_capacity: Option<u64>,
    pub voice_credits_used: u64,
    pub voice_credits_capacity: Option<u64>,
    pub image_credits_used: u64,
    pub image_credits_capacity: Option<u64>,
}

impl PlanInfo {
    pub fn unlimited() -> Self {
        Self {
            plan_id: "unlimited".into(),
            ..Self::default()
        }
    }

    /// Same remaining budget for every kind.
    pub fn uniform(credits: u64) -> Self {
        Self {
            plan_id: "uniform".into(),
            text_credits_capacity: Some(credits),
            voice_credits_capacity: Some(credits),
            image_credits_capacity: Some(credits),
            ..Self::default()
        }
    }

    /// Credits left for `kind`, `None` when unlimited.
    pub fn remaining(&self, kind: FieldKind) -> Option<u64> {
        let (used, capacity) = match kind {
            FieldKind::Text => (self.text_credits_used, self.text_credits_capacity),
            FieldKind::Speech => (self.voice_credits_used, self.voice_credits_capacity),
            FieldKind::Image => (self.image_credits_used, self.image_credits_capacity),
        };
        capacity.map(|cap| cap.saturating_sub(used))
    }
}

/// Subscription collaborator. Queried on every admission; the gate never
/// caches the plan.
pub trait SubscriptionSource: Send + Sync {
    fn plan(&self) -> PlanInfo;
}

/// A plan fixed at construction, e.g. from the config file.
#[derive(Debug, Clone)]
pub struct StaticSubscription {
    plan: PlanInfo,
}

impl StaticSubscription {
    pub fn new(plan: PlanInfo) -> Self {
        Self { plan }
    }
}

impl SubscriptionSource for StaticSubscription {
    fn plan(&self) -> PlanInfo {
        self.plan.clone()
    }
}

#[derive(Debug)]
struct RateWindow {
    limit: u32,
    length: Duration,
    started: Instant,
    count: u32,
}

impl RateWindow {
    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.started) >= self.length {
            self.started = now;
            self.count = 0;
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    consumed: HashMap<FieldKind, u64>,
    window: Option<RateWindow>,
}

/// Shared quota for every node of every note in flight.
pub struct CapacityGate {
    source: Arc<dyn SubscriptionSource>,
    state: Mutex<GateState>,
}

impl CapacityGate {
    pub fn new(source: Arc<dyn SubscriptionSource>) -> Self {
        Self {
            source,
            state: Mutex::new(GateState::default()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(Arc::new(StaticSubscription::new(PlanInfo::unlimited())))
    }

    /// Additionally cap admissions per time window, across all kinds.
    pub fn with_rate_window(self, limit: u32, length: Duration) -> Self {
        self.state.lock().window = Some(RateWindow {
            limit,
            length,
            started: Instant::now(),
            count: 0,
        });
        self
    }

    /// Reserve `n` calls of `kind`, or fail without reserving anything.
    pub fn try_acquire(&self, kind: FieldKind, n: u64) -> Result<(), CapacityError> {
        let plan = self.source.plan();
        let mut state = self.state.lock();

        let consumed = state.consumed.get(&kind).copied().unwrap_or(0);
        if let Some(remaining) = plan.remaining(kind)
            && consumed.saturating_add(n) > remaining
        {
            debug!(%kind, consumed, remaining, "capacity denied");
            return Err(CapacityError::CreditsExhausted(kind));
        }

        if let Some(window) = state.window.as_mut() {
            window.roll(Instant::now());
            let wanted = u32::try_from(n).unwrap_or(u32::MAX);
            if window.count.saturating_add(wanted) > window.limit {
                debug!(%kind, limit = window.limit, "rate window denied");
                return Err(CapacityError::RateWindow {
                    limit: window.limit,
                });
            }
            window.count += wanted;
        }

        let consumed = state.consumed.entry(kind).or_insert(0);
        *consumed = consumed.saturating_add(n);
        Ok(())
    }

    /// Return budget reserved for work that was never attempted.
    pub fn release(&self, kind: FieldKind, n: u64) {
        let mut state = self.state.lock();
        if let Some(consumed) = state.consumed.get_mut(&kind) {
            *consumed = consumed.saturating_sub(n);
        }
        if let Some(window) = state.window.as_mut() {
            let returned = u32::try_from(n).unwrap_or(u32::MAX);
            window.count = window.count.saturating_sub(returned);
        }
    }

    pub fn consumed(&self, kind: FieldKind) -> u64 {
        self.state.lock().consumed.get(&kind).copied().unwrap_or(0)
    }
}
