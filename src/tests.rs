//! Testing utilities for the labeler.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::Result;
use atrium_api::types::string::{Datetime, Did};
use reqwest::StatusCode;
use url::Url;
use uuid::Uuid;

use crate::{
    applier::LabelApplier,
    autoban::AutoBan,
    chat::{LinkFacet, MessagingGateway},
    config::{AutoBanRule, NotificationMethod, ReportTypeLabels, Settings},
    error::ApiError,
    models::{
        AccountRef, EventKind, LABEL_EVENT_TYPE, LabelEvent, ModerationEvent, PostRef,
        ReportEvent, ReportReason, Subject,
    },
    notify::Notifier,
    ozone::{EventQuery, ModerationApi},
    retry::RetryPolicy,
    storage::{NOTIFIED_REPORTS, PersistedSet},
};

/// A temporary test directory that will be cleaned up when the struct is dropped.
pub(crate) struct TempDir {
    /// The path to the directory.
    path: PathBuf,
}

impl TempDir {
    /// Create a new temporary directory.
    pub(crate) fn new() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("autolabeler-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    /// Get the path to the directory.
    pub(crate) const fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

pub(crate) fn did(s: &str) -> Did {
    Did::new(s.to_owned()).expect("valid did")
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

/// `did:plc:abc123` style subjects become accounts, `at://` ones posts.
fn subject(s: &str) -> Subject {
    if s.starts_with("at://") {
        Subject::Post(PostRef {
            uri: s.to_owned(),
            cid: "bafyreitest".to_owned(),
        })
    } else {
        Subject::Account(AccountRef { did: did(s) })
    }
}

/// Settings shared by the pipeline tests.
///
/// `did:plc:mod1` and `did:plc:mod2` are trusted; `did:plc:pref` is not
/// trusted but asked for direct messages.
pub(crate) fn settings() -> Settings {
    Settings {
        labeler: did("did:plc:labeler"),
        ozone_url: Url::parse("https://ozone.example.com").expect("valid url"),
        trusted_moderators: [did("did:plc:mod1"), did("did:plc:mod2")]
            .into_iter()
            .collect(),
        valid_labels: strings(&["spam", "nsfw", "rude", "spam-ban"])
            .into_iter()
            .collect(),
        moderation_labels: strings(&["spam", "nsfw", "rude"]).into_iter().collect(),
        notification_preferences: HashMap::from([(
            did("did:plc:pref"),
            NotificationMethod::DirectMessage,
        )]),
        autoban_rules: vec![AutoBanRule {
            label: "spam-ban".to_owned(),
            threshold: 3,
            other_cap: 3,
        }],
        report_type_labels: ReportTypeLabels {
            spam: strings(&["spam"]),
            ..ReportTypeLabels::default()
        },
    }
}

/// A label event by the test labeler.
pub(crate) fn label_event(id: i64, on: &str, add: &[&str], remove: &[&str]) -> ModerationEvent {
    ModerationEvent {
        id,
        event: EventKind::Label(LabelEvent {
            comment: None,
            create_label_vals: strings(add),
            negate_label_vals: strings(remove),
        }),
        subject: subject(on),
        created_by: did("did:plc:labeler"),
        creator_handle: None,
        created_at: Datetime::now(),
    }
}

/// A report filed by `reporter`.
pub(crate) fn report_event(
    id: i64,
    on: &str,
    reporter: &str,
    comment: Option<&str>,
    reason: ReportReason,
) -> ModerationEvent {
    ModerationEvent {
        id,
        event: EventKind::Report(ReportEvent {
            comment: comment.map(str::to_owned),
            report_type: reason,
        }),
        subject: subject(on),
        created_by: did(reporter),
        creator_handle: Some(format!("{}.test", reporter.rsplit(':').next().unwrap_or(reporter))),
        created_at: Datetime::now(),
    }
}

/// A label event the fake accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct EmittedLabel {
    pub subject: Subject,
    pub add: Vec<String>,
    pub remove: Vec<String>,
    pub comment: String,
}

#[derive(Clone, Copy, Debug)]
enum LabelFailure {
    Reject,
    TimeOut,
}

#[derive(Default)]
struct ModerationState {
    reports: Vec<ModerationEvent>,
    report_errors: VecDeque<ApiError>,
    report_queries: usize,
    history: Vec<ModerationEvent>,
    history_fails: bool,
    history_queries: usize,
    label_failures: HashMap<String, LabelFailure>,
    label_attempts: HashMap<String, u32>,
    emitted: Vec<EmittedLabel>,
    acknowledged: Vec<(Subject, String)>,
    acknowledge_fails: bool,
    reauthentications: usize,
}

/// A scripted [`ModerationApi`]. Clones share state.
#[derive(Clone)]
pub(crate) struct FakeModerationApi {
    labeler: Did,
    state: Arc<Mutex<ModerationState>>,
}

impl Default for FakeModerationApi {
    fn default() -> Self {
        Self {
            labeler: did("did:plc:labeler"),
            state: Arc::default(),
        }
    }
}

impl FakeModerationApi {
    fn state(&self) -> MutexGuard<'_, ModerationState> {
        self.state.lock().expect("fake state lock")
    }

    pub(crate) fn set_reports(&self, reports: Vec<ModerationEvent>) {
        self.state().reports = reports;
    }

    /// Fail the next report query with `error`.
    pub(crate) fn fail_reports(&self, error: ApiError) {
        self.state().report_errors.push_back(error);
    }

    pub(crate) fn set_history(&self, history: Vec<ModerationEvent>) {
        self.state().history = history;
    }

    pub(crate) fn fail_history(&self) {
        self.state().history_fails = true;
    }

    /// Time out every acknowledgement.
    pub(crate) fn fail_acknowledge(&self) {
        self.state().acknowledge_fails = true;
    }

    /// Reject `label` as an invalid request.
    pub(crate) fn reject_label(&self, label: &str) {
        let _previous = self
            .state()
            .label_failures
            .insert(label.to_owned(), LabelFailure::Reject);
    }

    /// Time out every attempt to apply `label`.
    pub(crate) fn time_out_label(&self, label: &str) {
        let _previous = self
            .state()
            .label_failures
            .insert(label.to_owned(), LabelFailure::TimeOut);
    }

    pub(crate) fn label_attempts(&self, label: &str) -> u32 {
        self.state().label_attempts.get(label).copied().unwrap_or(0)
    }

    pub(crate) fn emitted_labels(&self) -> Vec<EmittedLabel> {
        self.state().emitted.clone()
    }

    pub(crate) fn acknowledged(&self) -> Vec<(Subject, String)> {
        self.state().acknowledged.clone()
    }

    pub(crate) fn report_queries(&self) -> usize {
        self.state().report_queries
    }

    pub(crate) fn history_queries(&self) -> usize {
        self.state().history_queries
    }

    pub(crate) fn reauthentications(&self) -> usize {
        self.state().reauthentications
    }
}

impl ModerationApi for FakeModerationApi {
    fn labeler(&self) -> &Did {
        &self.labeler
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<ModerationEvent>, ApiError> {
        let mut state = self.state();
        if query.types.contains(&LABEL_EVENT_TYPE) {
            state.history_queries += 1;
            if state.history_fails {
                return Err(ApiError::Timeout);
            }
            return Ok(state.history.clone());
        }

        state.report_queries += 1;
        match state.report_errors.pop_front() {
            Some(e) => Err(e),
            None => Ok(state.reports.clone()),
        }
    }

    async fn emit_label(
        &self,
        subject: &Subject,
        add: &[String],
        remove: &[String],
        comment: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.state();
        let label = add.first().or_else(|| remove.first()).cloned().unwrap_or_default();
        *state.label_attempts.entry(label.clone()).or_default() += 1;

        let failure = state.label_failures.get(&label).copied();
        match failure {
            Some(LabelFailure::Reject) => Err(ApiError::Xrpc {
                status: StatusCode::BAD_REQUEST,
                error: Some("InvalidRequest".to_owned()),
                message: Some(format!("Invalid label value: {label}")),
            }),
            Some(LabelFailure::TimeOut) => Err(ApiError::Timeout),
            None => {
                state.emitted.push(EmittedLabel {
                    subject: subject.clone(),
                    add: add.to_vec(),
                    remove: remove.to_vec(),
                    comment: comment.to_owned(),
                });
                Ok(())
            }
        }
    }

    async fn emit_acknowledge(&self, subject: &Subject, comment: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        if state.acknowledge_fails {
            return Err(ApiError::Timeout);
        }
        state.acknowledged.push((subject.clone(), comment.to_owned()));
        Ok(())
    }

    async fn reauthenticate(&self) -> Result<(), ApiError> {
        self.state().reauthentications += 1;
        Ok(())
    }
}

/// A direct message the gateway accepted.
#[derive(Clone, Debug)]
pub(crate) struct SentMessage {
    pub recipient: String,
    pub text: String,
    pub links: Vec<LinkFacet>,
}

#[derive(Default)]
struct GatewayState {
    failing: bool,
    sent: Vec<SentMessage>,
}

/// A [`MessagingGateway`] that records messages. Clones share state.
#[derive(Clone, Default)]
pub(crate) struct RecordingGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl RecordingGateway {
    /// A gateway whose sends fail until [`Self::set_failing`] is cleared.
    pub(crate) fn failing() -> Self {
        let gateway = Self::default();
        gateway.set_failing(true);
        gateway
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.state.lock().expect("gateway lock").failing = failing;
    }

    pub(crate) fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().expect("gateway lock").sent.clone()
    }
}

impl MessagingGateway for RecordingGateway {
    async fn send_direct_message(
        &self,
        recipient: &Did,
        text: &str,
        links: &[LinkFacet],
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock().expect("gateway lock");
        if state.failing {
            return Err(ApiError::Xrpc {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: Some("InternalServerError".to_owned()),
                message: None,
            });
        }

        state.sent.push(SentMessage {
            recipient: recipient.as_str().to_owned(),
            text: text.to_owned(),
            links: links.to_vec(),
        });
        Ok(())
    }
}

/// A label applier over the fakes, configured from [`settings`].
pub(crate) fn applier(
    api: &FakeModerationApi,
    gateway: &RecordingGateway,
    dir: &TempDir,
) -> LabelApplier<FakeModerationApi, RecordingGateway> {
    let settings = settings();
    LabelApplier::new(
        api.clone(),
        RetryPolicy::default(),
        settings.valid_labels.clone(),
        AutoBan::from_settings(&settings),
        Notifier::new(
            gateway.clone(),
            &settings,
            PersistedSet::open(dir.path().join(NOTIFIED_REPORTS)),
        ),
    )
}
