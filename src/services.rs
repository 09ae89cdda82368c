// =============================================================================
// Services bundle — explicit dependencies for every subsystem
// =============================================================================
//
// The single source of truth the engine hands to its tasks: configuration,
// store, market data, learner, agent, and the clock. Passing the bundle
// explicitly (instead of module-level singletons) keeps every component
// testable; the clock in particular is injectable so the outcome tracker
// can be driven deterministically in tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::agent::DecisionAgent;
use crate::config::EngineConfig;
use crate::learning::CausalLearner;
use crate::market::MarketDataService;
use crate::store::Database;

/// Wall-clock source. Production uses `SystemClock`; tests drive a
/// `ManualClock` forward explicitly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used by deterministic tests of the
/// outcome tracker and causal learner.
#[cfg(test)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Shared handles for the whole engine. Cloned cheaply via `Arc`.
pub struct Services {
    pub config: Arc<RwLock<EngineConfig>>,
    pub store: Arc<Database>,
    pub market: Arc<MarketDataService>,
    pub learner: Arc<CausalLearner>,
    pub agent: Arc<DecisionAgent>,
    pub clock: Arc<dyn Clock>,
}
