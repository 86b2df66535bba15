//! Per-tenant request rate limiting
//!
//! Sliding-window limiter keyed by tenant and route class. Control-plane
//! calls (start/stop) get a tighter budget than trade actions.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::LimitsConfig;
use crate::types::TenantId;

/// Which budget a route draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// Instance lifecycle: start, stop
    Control,
    /// Forwarded trade actions: forcebuy, forcesell
    Trade,
}

/// Sliding-window call log per (tenant, class).
pub struct RateLimiter {
    window: Duration,
    control_max: u32,
    trade_max: u32,
    calls: Mutex<HashMap<(TenantId, RouteClass), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            window: Duration::from_secs(limits.window_secs),
            control_max: limits.control_per_window,
            trade_max: limits.trade_per_window,
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn max_for(&self, class: RouteClass) -> u32 {
        match class {
            RouteClass::Control => self.control_max,
            RouteClass::Trade => self.trade_max,
        }
    }

    /// Record a call attempt. `Err` carries a retry-after hint in seconds.
    pub fn check(&self, tenant: &TenantId, class: RouteClass) -> Result<(), u64> {
        let now = Instant::now();
        let mut calls = self.calls.lock().expect("rate limiter lock poisoned");
        let log = calls.entry((tenant.clone(), class)).or_default();

        // Drop calls that fell out of the window.
        while let Some(front) = log.front() {
            if now.duration_since(*front) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() >= self.max_for(class) as usize {
            let oldest = *log.front().expect("nonempty log");
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(retry_after.as_secs().max(1));
        }

        log.push_back(now);
        Ok(())
    }
}
