//! Metric name constants.

use std::time::Duration;

use anyhow::Context;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config;

pub const POLL_FAILED: &str = "autolabeler.poll.failed"; // Counter.
pub const POLL_CURSOR: &str = "autolabeler.poll.cursor"; // Gauge.

pub const REPORTS_PROCESSED: &str = "autolabeler.reports.processed"; // Counter.
pub const REPORTS_ACKNOWLEDGED: &str = "autolabeler.reports.acknowledged"; // Counter.

pub const LABELS_APPLIED: &str = "autolabeler.labels.applied"; // Counter.
pub const LABELS_FAILED: &str = "autolabeler.labels.failed"; // Counter.

pub const AUTOBAN_ESCALATIONS: &str = "autolabeler.autoban.escalations"; // Counter.
pub const NOTIFICATIONS_SENT: &str = "autolabeler.notifications.sent"; // Counter.

/// Must be ran exactly once on startup. This will declare all of the instruments for `metrics`.
pub fn setup(config: &Option<config::MetricConfig>) -> anyhow::Result<()> {
    describe_counter!(POLL_FAILED, "The number of failed moderation event queries.");
    describe_gauge!(POLL_CURSOR, "The id of the newest report event handled.");

    describe_counter!(REPORTS_PROCESSED, "New report events handled by the poller.");
    describe_counter!(
        REPORTS_ACKNOWLEDGED,
        "Reports acknowledged after all of their labels were applied."
    );

    describe_counter!(LABELS_APPLIED, "Labels successfully added or removed.");
    describe_counter!(LABELS_FAILED, "Labels that could not be applied.");

    describe_counter!(
        AUTOBAN_ESCALATIONS,
        "Escalation labels applied by auto-ban rules."
    );
    describe_counter!(
        NOTIFICATIONS_SENT,
        "Failure notifications delivered to moderators."
    );

    if let Some(config) = config {
        match config {
            config::MetricConfig::PrometheusPush(prometheus_config) => {
                PrometheusBuilder::new()
                    .with_push_gateway(
                        prometheus_config.url.clone(),
                        Duration::from_secs(10),
                        None,
                        None,
                    )
                    .context("failed to set up push gateway")?
                    .install()
                    .context("failed to install metrics exporter")?;
            }
        }
    }

    Ok(())
}
