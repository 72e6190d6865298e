//! Metrics for a command-line tool: we collect them in memory, and log them
//! in Prometheus format when we're done.

use anyhow::Error;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::Result;

/// A handle to our installed metrics recorder.
pub struct MetricsReporter {
    handle: PrometheusHandle,
}

impl MetricsReporter {
    /// Install a global metrics recorder, labeling every metric with the
    /// subcommand we're running.
    pub fn install(command: &str) -> Result<MetricsReporter> {
        let handle = PrometheusBuilder::new()
            .add_global_label("command", command)
            .install_recorder()
            .map_err(Error::new)?;
        Ok(MetricsReporter { handle })
    }

    /// Log everything we've recorded.
    pub fn report(&self) {
        info!("Metrics:\n{}", self.handle.render());
    }
}
