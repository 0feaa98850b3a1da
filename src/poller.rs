//! The report polling loop.
use std::{collections::HashSet, time::Duration};

use atrium_api::types::string::Did;
use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

use crate::{
    applier::{LabelApplier, ReportContext},
    chat::MessagingGateway,
    command::{self, LabelCommand},
    config::{ReportTypeLabels, Settings},
    metrics::{POLL_CURSOR, POLL_FAILED, REPORTS_PROCESSED},
    models::{ModerationEvent, ReportType},
    ozone::{EventQuery, ModerationApi},
    storage::{CursorStore, PersistedSet},
};

pub struct Poller<M, G> {
    applier: LabelApplier<M, G>,
    trusted: HashSet<Did>,
    report_type_labels: ReportTypeLabels,
    cursor: CursorStore,
    processed: PersistedSet<i64>,
}

impl<M: ModerationApi, G: MessagingGateway> Poller<M, G> {
    pub fn new(
        applier: LabelApplier<M, G>,
        settings: &Settings,
        cursor: CursorStore,
        processed: PersistedSet<i64>,
    ) -> Self {
        if let Some(c) = cursor.get() {
            info!("resuming from cursor {c}");
        }
        if !processed.is_empty() {
            info!("{} reports already processed", processed.len());
        }

        Self {
            applier,
            trusted: settings.trusted_moderators.clone(),
            report_type_labels: settings.report_type_labels.clone(),
            cursor,
            processed,
        }
    }

    /// The highest report id handled so far.
    pub const fn cursor(&self) -> Option<i64> {
        self.cursor.get()
    }

    /// Poll every `interval` until Ctrl-C.
    pub async fn run(mut self, interval: Duration) {
        info!(
            "polling for reports every {interval:?} (cursor {:?})",
            self.cursor()
        );
        loop {
            self.poll().await;

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!("failed to listen for shutdown signal: {e}");
                    }
                    info!("shutting down");
                    return;
                }
            }
        }
    }

    /// One iteration. Errors are logged, never returned.
    pub async fn poll(&mut self) {
        let events = match self.applier.api().query_events(&EventQuery::reports()).await {
            Ok(events) => events,
            Err(e) => {
                counter!(POLL_FAILED).increment(1);
                error!("failed to fetch reports: {e}");
                if e.is_session_expired() {
                    info!("session expired, logging in again");
                    if let Err(e) = self.applier.api().reauthenticate().await {
                        error!("failed to log in again: {e}");
                    }
                }
                return;
            }
        };

        let mut reports: Vec<ModerationEvent> =
            events.into_iter().filter(|e| e.report().is_some()).collect();
        reports.sort_by_key(|e| e.id);

        let Some(cursor) = self.cursor.get() else {
            self.baseline(&reports);
            return;
        };

        for report in reports.iter().filter(|r| r.id > cursor) {
            self.process(report).await;
        }
    }

    /// Skip everything that already exists.
    fn baseline(&mut self, reports: &[ModerationEvent]) {
        let cursor = reports.last().map_or(0, |r| r.id);
        info!(
            "baseline: skipping {} existing reports, cursor set to {cursor}",
            reports.len()
        );
        self.advance(cursor);
    }

    async fn process(&mut self, event: &ModerationEvent) {
        if self.processed.contains(&event.id) {
            debug!("report {} already processed", event.id);
            self.advance(event.id);
            return;
        }

        info!("new report {} from {}", event.id, event.creator_name());
        if self.trusted.contains(&event.created_by) {
            let commands = self.commands_for(event);
            if commands.is_empty() {
                debug!("report {} has no label commands", event.id);
            } else {
                let report = ReportContext {
                    id: event.id,
                    subject: &event.subject,
                    report_type: ReportType::from(&event.subject),
                    moderator: &event.created_by,
                    moderator_name: event.creator_name(),
                };
                let _outcomes = self.applier.process_commands(&commands, report).await;
            }
        } else {
            debug!(
                "ignoring report {} from untrusted {}",
                event.id,
                event.created_by.as_str()
            );
        }

        counter!(REPORTS_PROCESSED).increment(1);
        if let Err(e) = self.processed.add(event.id) {
            warn!("failed to record report {} as processed: {e:#}", event.id);
        }
        self.advance(event.id);
    }

    /// Commands from the report comment, then the labels its reason implies.
    fn commands_for(&self, event: &ModerationEvent) -> Vec<LabelCommand> {
        let Some(report) = event.report() else {
            return Vec::new();
        };

        let mut commands = report.comment.as_deref().map(command::parse).unwrap_or_default();
        let implied = self.report_type_labels.labels_for(&report.report_type).to_vec();
        if let Some(cmd) = LabelCommand::implied(implied) {
            debug!("report reason {} implies {:?}", report.report_type, cmd.labels);
            commands.push(cmd);
        }
        commands
    }

    fn advance(&mut self, id: i64) {
        if self.cursor.get().is_some_and(|c| c >= id) {
            return;
        }
        if let Err(e) = self.cursor.set(id) {
            warn!("failed to persist cursor {id}: {e:#}");
        }
        gauge!(POLL_CURSOR).set(id as f64);
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::*;
    use crate::{
        error::ApiError,
        models::{ReportReason, Subject},
        storage::{CURSOR, PROCESSED_REPORTS},
        tests::{FakeModerationApi, RecordingGateway, TempDir, applier, did, report_event, settings},
    };

    const POST: &str = "at://did:plc:abc123/app.bsky.feed.post/xyz";

    fn poller(
        api: &FakeModerationApi,
        gateway: &RecordingGateway,
        dir: &TempDir,
    ) -> Poller<FakeModerationApi, RecordingGateway> {
        Poller::new(
            applier(api, gateway, dir),
            &settings(),
            CursorStore::open(dir.path().join(CURSOR)),
            PersistedSet::open(dir.path().join(PROCESSED_REPORTS)),
        )
    }

    fn trusted_report(id: i64, comment: &str) -> ModerationEvent {
        report_event(id, POST, "did:plc:mod1", Some(comment), ReportReason::Other)
    }

    #[tokio::test(start_paused = true)]
    async fn baseline_skips_existing_reports() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let api = FakeModerationApi::default();
        let gateway = RecordingGateway::default();
        // Newest first, as the API returns them.
        api.set_reports((1..=5).rev().map(|id| trusted_report(id, "add spam")).collect());

        let mut poller = poller(&api, &gateway, &dir);
        poller.poll().await;

        assert_eq!(poller.cursor(), Some(5));
        assert!(api.emitted_labels().is_empty());

        // Only strictly newer reports are processed afterwards.
        api.set_reports((1..=7).rev().map(|id| trusted_report(id, "add spam")).collect());
        poller.poll().await;

        assert_eq!(poller.cursor(), Some(7));
        assert_eq!(api.emitted_labels().len(), 2);
        assert_eq!(api.acknowledged().len(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn empty_baseline_starts_at_zero() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let api = FakeModerationApi::default();
        let gateway = RecordingGateway::default();

        let mut poller = poller(&api, &gateway, &dir);
        poller.poll().await;
        assert_eq!(poller.cursor(), Some(0));

        api.set_reports(vec![trusted_report(1, "add nsfw")]);
        poller.poll().await;
        assert_eq!(api.emitted_labels()[0].add, vec!["nsfw".to_owned()]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_from_persisted_cursor() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        CursorStore::open(dir.path().join(CURSOR)).set(3)?;

        let api = FakeModerationApi::default();
        let gateway = RecordingGateway::default();
        api.set_reports((1..=5).map(|id| trusted_report(id, "add spam")).collect());

        let mut poller = poller(&api, &gateway, &dir);
        poller.poll().await;

        assert_eq!(poller.cursor(), Some(5));
        assert_eq!(api.emitted_labels().len(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn processed_reports_are_not_reapplied() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        CursorStore::open(dir.path().join(CURSOR)).set(0)?;
        let _added = PersistedSet::open(dir.path().join(PROCESSED_REPORTS)).add(1_i64)?;

        let api = FakeModerationApi::default();
        let gateway = RecordingGateway::default();
        api.set_reports(vec![trusted_report(1, "add spam"), trusted_report(2, "add nsfw")]);

        let mut poller = poller(&api, &gateway, &dir);
        poller.poll().await;

        let emitted = api.emitted_labels();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].add, vec!["nsfw".to_owned()]);
        assert!(PersistedSet::<i64>::open(dir.path().join(PROCESSED_REPORTS)).contains(&2));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn untrusted_reports_are_skipped_but_recorded() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        CursorStore::open(dir.path().join(CURSOR)).set(0)?;

        let api = FakeModerationApi::default();
        let gateway = RecordingGateway::default();
        api.set_reports(vec![report_event(
            1,
            POST,
            "did:plc:stranger",
            Some("add spam"),
            ReportReason::Spam,
        )]);

        let mut poller = poller(&api, &gateway, &dir);
        poller.poll().await;

        assert!(api.emitted_labels().is_empty());
        assert_eq!(poller.cursor(), Some(1));
        assert!(PersistedSet::<i64>::open(dir.path().join(PROCESSED_REPORTS)).contains(&1));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn report_reason_implies_labels() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        CursorStore::open(dir.path().join(CURSOR)).set(0)?;

        let api = FakeModerationApi::default();
        let gateway = RecordingGateway::default();
        api.set_reports(vec![report_event(
            1,
            "did:plc:abc123",
            "did:plc:mod2",
            None,
            ReportReason::Spam,
        )]);

        let mut poller = poller(&api, &gateway, &dir);
        poller.poll().await;

        let emitted = api.emitted_labels();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].subject, Subject::account(did("did:plc:abc123")));
        assert_eq!(emitted[0].add, vec!["spam".to_owned()]);
        assert_eq!(emitted[0].comment, "Auto-added by @mod2.test");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reports_still_advance() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        CursorStore::open(dir.path().join(CURSOR)).set(0)?;

        let api = FakeModerationApi::default();
        api.reject_label("spam");
        let gateway = RecordingGateway::default();
        api.set_reports(vec![trusted_report(1, "add spam")]);

        let mut poller = poller(&api, &gateway, &dir);
        poller.poll().await;
        poller.poll().await;

        assert_eq!(poller.cursor(), Some(1));
        assert_eq!(api.label_attempts("spam"), 1);
        assert_eq!(gateway.sent().len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_logs_in_again() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let api = FakeModerationApi::default();
        let gateway = RecordingGateway::default();
        api.fail_reports(ApiError::Xrpc {
            status: StatusCode::BAD_REQUEST,
            error: Some("ExpiredToken".to_owned()),
            message: Some("Token has expired".to_owned()),
        });
        api.fail_reports(ApiError::Timeout);

        let mut poller = poller(&api, &gateway, &dir);
        poller.poll().await;
        assert_eq!(api.reauthentications(), 1);
        assert_eq!(poller.cursor(), None);

        // Other failures do not log in again.
        poller.poll().await;
        assert_eq!(api.reauthentications(), 1);

        poller.poll().await;
        assert_eq!(api.report_queries(), 3);
        assert_eq!(poller.cursor(), Some(0));
        Ok(())
    }
}
