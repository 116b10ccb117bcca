//! Admission control for transcode sessions.
//!
//! Each [`AdmissionClass`] is an independent pool with its own capacity and
//! its own lock. Admission never waits: a request that does not fit is
//! rejected immediately and the caller reports "busy" to the client.
//!
//! A granted [`AdmissionTicket`] returns its weight to the pool when it is
//! dropped, so every exit path of the owning task releases it exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;

/// Named admission pool.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AdmissionClass {
    Transcode,
    CpuHeavy,
}

/// Pool capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub transcode_capacity: u32,
    pub cpu_heavy_capacity: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            transcode_capacity: 10,
            cpu_heavy_capacity: 10,
        }
    }
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub class: AdmissionClass,
    pub capacity: u32,
    pub in_use: u32,
}

impl PoolSnapshot {
    pub fn is_full(&self) -> bool {
        self.in_use >= self.capacity
    }
}

#[derive(Debug)]
struct Pool {
    class: AdmissionClass,
    capacity: u32,
    in_use: Mutex<u32>,
}

impl Pool {
    fn new(class: AdmissionClass, capacity: u32) -> Self {
        Self {
            class,
            capacity,
            in_use: Mutex::new(0),
        }
    }

    fn try_reserve(&self, weight: u32) -> std::result::Result<u32, u32> {
        let mut in_use = self.in_use.lock();
        if in_use.saturating_add(weight) > self.capacity {
            return Err(*in_use);
        }
        *in_use += weight;
        Ok(*in_use)
    }

    fn give_back(&self, weight: u32) {
        let mut in_use = self.in_use.lock();
        debug_assert!(*in_use >= weight, "admission pool underflow");
        *in_use = in_use.saturating_sub(weight);
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            class: self.class,
            capacity: self.capacity,
            in_use: *self.in_use.lock(),
        }
    }
}

/// A reserved slot in one pool.
///
/// Not `Clone`. Dropping the ticket releases it.
#[derive(Debug)]
pub struct AdmissionTicket {
    id: u64,
    weight: u32,
    pool: Arc<Pool>,
}

impl AdmissionTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class(&self) -> AdmissionClass {
        self.pool.class
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.pool.give_back(self.weight);
        debug!(
            ticket = self.id,
            class = %self.pool.class,
            weight = self.weight,
            "Admission ticket released"
        );
    }
}

/// Gatekeeper over the admission pools.
pub struct AdmissionController {
    transcode: Arc<Pool>,
    cpu_heavy: Arc<Pool>,
    next_ticket: AtomicU64,
    metrics: Option<Arc<MetricsCollector>>,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            transcode: Arc::new(Pool::new(
                AdmissionClass::Transcode,
                config.transcode_capacity,
            )),
            cpu_heavy: Arc::new(Pool::new(
                AdmissionClass::CpuHeavy,
                config.cpu_heavy_capacity,
            )),
            next_ticket: AtomicU64::new(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn pool(&self, class: AdmissionClass) -> &Arc<Pool> {
        match class {
            AdmissionClass::Transcode => &self.transcode,
            AdmissionClass::CpuHeavy => &self.cpu_heavy,
        }
    }

    /// Reserve `weight` units of `class` without waiting.
    pub fn try_admit(&self, class: AdmissionClass, weight: u32) -> Result<AdmissionTicket> {
        let pool = self.pool(class);
        if weight == 0 || weight > pool.capacity {
            return Err(Error::validation(format!(
                "admission weight {weight} is outside 1..={} for class {class}",
                pool.capacity
            )));
        }

        match pool.try_reserve(weight) {
            Ok(in_use) => {
                let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                debug!(ticket = id, %class, weight, in_use, "Admission granted");
                if let Some(metrics) = &self.metrics {
                    metrics.record_admission_granted(class);
                }
                Ok(AdmissionTicket {
                    id,
                    weight,
                    pool: Arc::clone(pool),
                })
            }
            Err(in_use) => {
                warn!(
                    %class,
                    weight,
                    in_use,
                    capacity = pool.capacity,
                    "Admission rejected: pool full"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_admission_denied(class);
                }
                Err(Error::AdmissionRejected {
                    class: class.to_string(),
                    requested: weight,
                    in_use,
                    capacity: pool.capacity,
                })
            }
        }
    }

    /// Return a ticket to its pool.
    ///
    /// Equivalent to dropping it; the ticket is consumed so it cannot be
    /// released twice.
    pub fn release(&self, ticket: AdmissionTicket) {
        drop(ticket);
    }

    pub fn snapshot(&self, class: AdmissionClass) -> PoolSnapshot {
        self.pool(class).snapshot()
    }

    pub fn snapshots(&self) -> Vec<PoolSnapshot> {
        vec![self.transcode.snapshot(), self.cpu_heavy.snapshot()]
    }
}
