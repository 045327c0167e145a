//! Shared test utilities for cluster transport testing.
//!
//! Feature-gated behind `testutil` so it never leaks into production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! connector-cluster-transport = { path = "../transport", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use connector_cluster_transport::testutil::{TokioClock, connect_processes};
//! ```

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

use crate::{
    clock::{Clock, SharedClock},
    memory::{MemoryCluster, MemoryTransport},
};

/// Wall clock anchored to tokio's clock.
///
/// Reports `anchor + (tokio::time::Instant::now() - start)`. Under
/// `#[tokio::test(start_paused = true)]`, wall time therefore moves exactly
/// when `tokio::time::advance` (or auto-advance) moves timers, which keeps
/// epoch comparisons and scheduled timers consistent.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor: DateTime<Utc>,
    start: Instant,
}

impl TokioClock {
    /// Creates a clock reading `anchor` right now.
    #[must_use]
    pub fn starting_at(anchor: DateTime<Utc>) -> Self {
        Self { anchor, start: Instant::now() }
    }

    /// Creates a clock anchored at a fixed, round epoch second
    /// (`2024-01-01T00:00:00Z`), which keeps test timestamps readable.
    #[must_use]
    pub fn fixed() -> Self {
        Self::starting_at(DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default())
    }

    /// Returns the clock as a shared handle.
    #[must_use]
    pub fn shared(self) -> SharedClock {
        Arc::new(self)
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.start);
        self.anchor + TimeDelta::from_std(elapsed).unwrap_or(TimeDelta::MAX)
    }
}

/// Creates a cluster and `count` connected processes.
#[must_use]
pub fn connect_processes(count: usize) -> (MemoryCluster, Vec<MemoryTransport>) {
    let cluster = MemoryCluster::new();
    let transports = (0..count).map(|i| cluster.connect_as(format!("process-{i}"))).collect();
    (cluster, transports)
}
