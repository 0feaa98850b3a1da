//! Application of label commands to a report.
//!
//! Each command is resolved to a subject, then every label is validated and
//! applied on its own. The report is acknowledged only when every label of a
//! command succeeded; otherwise the moderator is told which labels failed.
use std::collections::HashSet;

use atrium_api::types::string::Did;
use metrics::counter;
use tracing::{info, warn};

use crate::{
    autoban::AutoBan,
    chat::MessagingGateway,
    command::{Action, LabelCommand},
    metrics::{LABELS_APPLIED, LABELS_FAILED, REPORTS_ACKNOWLEDGED},
    models::{ReportType, Subject},
    notify::Notifier,
    ozone::ModerationApi,
    retry::{self, RetryPolicy},
    target,
};

/// The report a batch of commands came from.
#[derive(Clone, Copy, Debug)]
pub struct ReportContext<'a> {
    pub id: i64,
    pub subject: &'a Subject,
    pub report_type: ReportType,
    pub moderator: &'a Did,
    /// Handle (or DID) used in event comments.
    pub moderator_name: &'a str,
}

/// Per-label results of one command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl CommandOutcome {
    /// `Failed: [a, b], Succeeded: [c]`
    pub fn summary(&self) -> String {
        let mut summary = format!("Failed: [{}]", self.failed.join(", "));
        if !self.succeeded.is_empty() {
            summary.push_str(&format!(", Succeeded: [{}]", self.succeeded.join(", ")));
        }
        summary
    }
}

pub struct LabelApplier<M, G> {
    api: M,
    policy: RetryPolicy,
    valid_labels: HashSet<String>,
    autoban: AutoBan,
    notifier: Notifier<G>,
}

impl<M: ModerationApi, G: MessagingGateway> LabelApplier<M, G> {
    pub const fn new(
        api: M,
        policy: RetryPolicy,
        valid_labels: HashSet<String>,
        autoban: AutoBan,
        notifier: Notifier<G>,
    ) -> Self {
        Self {
            api,
            policy,
            valid_labels,
            autoban,
            notifier,
        }
    }

    pub const fn api(&self) -> &M {
        &self.api
    }

    /// Apply `commands` in order. Unresolvable commands are skipped and yield
    /// no outcome.
    pub async fn process_commands(
        &mut self,
        commands: &[LabelCommand],
        report: ReportContext<'_>,
    ) -> Vec<CommandOutcome> {
        let mut outcomes = Vec::with_capacity(commands.len());
        for command in commands {
            if let Some(outcome) = self.handle_command(command, report).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    async fn handle_command(
        &mut self,
        command: &LabelCommand,
        report: ReportContext<'_>,
    ) -> Option<CommandOutcome> {
        let subject = match target::resolve(command.target, report.report_type, report.subject) {
            Ok(subject) => subject,
            Err(e) => {
                warn!("report {}: {e}", report.id);
                return None;
            }
        };

        info!(
            "applying labels [{}] to {subject} ({} report {})",
            command.labels.join(", "),
            report.report_type,
            report.id
        );

        let comment = format!(
            "Auto-{} by @{}",
            command.action.past_tense(),
            report.moderator_name
        );
        let mut outcome = CommandOutcome::default();
        for label in &command.labels {
            if !self.valid_labels.contains(label) {
                warn!("invalid label {label} (not in valid labels list)");
                counter!(LABELS_FAILED).increment(1);
                outcome.failed.push(label.clone());
                continue;
            }

            match retry::emit_label(
                &self.api,
                &self.policy,
                &subject,
                command.action,
                label,
                &comment,
            )
            .await
            {
                Ok(()) => {
                    info!("{} label {label}", command.action.past_tense());
                    counter!(LABELS_APPLIED).increment(1);
                    outcome.succeeded.push(label.clone());

                    if command.action == Action::Add {
                        if let Some(account) = subject.account_did() {
                            let _escalated = self
                                .autoban
                                .check_thresholds(&self.api, &self.policy, label, &account)
                                .await;
                        }
                    }
                }
                Err(_) => {
                    counter!(LABELS_FAILED).increment(1);
                    outcome.failed.push(label.clone());
                }
            }
        }

        info!(
            "label results: {} failed, {} succeeded",
            outcome.failed.len(),
            outcome.succeeded.len()
        );

        if outcome.failed.is_empty() {
            self.acknowledge(report).await;
        } else {
            let _delivery = self
                .notifier
                .notify_failure(report.moderator, &outcome.summary(), report.subject, report.id)
                .await;
        }

        Some(outcome)
    }

    /// Acknowledge the report. Failures are logged only.
    async fn acknowledge(&self, report: ReportContext<'_>) {
        let comment = format!("Auto-resolved after labeling by @{}", report.moderator_name);
        match self.api.emit_acknowledge(report.subject, &comment).await {
            Ok(()) => {
                counter!(REPORTS_ACKNOWLEDGED).increment(1);
                info!("report {} acknowledged", report.id);
            }
            Err(e) => warn!("failed to acknowledge report {}: {e}", report.id),
        }
    }
}
