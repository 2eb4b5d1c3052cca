//! Observability for agent runs.
//!
//! [`init_tracing`] installs the process-wide subscriber. The observers plug
//! into an agent's callbacks: [`TracingStepObserver`] logs every appended
//! record and [`RunMetrics`] aggregates counters across runs.

#![warn(missing_docs, clippy::pedantic)]

mod metrics;
mod observer;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use metrics::{MetricsSnapshot, RunMetrics};
pub use observer::TracingStepObserver;

/// Installs a formatted stdout subscriber. `RUST_LOG` wins over
/// `default_filter` when set.
///
/// # Errors
///
/// Fails when a global subscriber is already installed or the filter does
/// not parse.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)?,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;
    Ok(())
}
