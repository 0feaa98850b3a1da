//! The Ozone moderation API.
//!
//! Requests go to the labeler account's PDS, which proxies them to the labeler
//! service named in the `atproto-proxy` header.
//!
//! Reference: <https://atproto.com/specs/xrpc#service-proxying>
use std::future::Future;

use atrium_api::types::string::Did;
use serde::{Deserialize, Serialize, de::IgnoredAny};
use tracing::debug;

use crate::{
    auth::{Session, xrpc_url},
    error::ApiError,
    models::{
        AcknowledgeEvent, EmittedEvent, LABEL_EVENT_TYPE, LabelEvent, ModerationEvent,
        REPORT_EVENT_TYPE, Subject,
    },
};

/// Largest page `queryEvents` returns.
pub const MAX_PAGE: u8 = 100;

/// Filter for `tools.ozone.moderation.queryEvents`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventQuery {
    /// Event `$type`s to include. Empty means all.
    pub types: Vec<&'static str>,
    pub created_by: Option<Did>,
    /// A DID or AT-URI.
    pub subject: Option<String>,
    /// With a DID subject, include events on the account's records too.
    pub include_all_user_records: bool,
    pub limit: Option<u8>,
}

impl EventQuery {
    /// The most recent report events.
    pub fn reports() -> Self {
        Self {
            types: vec![REPORT_EVENT_TYPE],
            ..Self::default()
        }
    }

    /// Label events `labeler` emitted for `account` or any of its records.
    pub fn label_history(labeler: &Did, account: &Did) -> Self {
        Self {
            types: vec![LABEL_EVENT_TYPE],
            created_by: Some(labeler.clone()),
            subject: Some(account.as_str().to_owned()),
            include_all_user_records: true,
            limit: Some(MAX_PAGE),
        }
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params: Vec<(&'static str, String)> = self
            .types
            .iter()
            .map(|t| ("types", (*t).to_owned()))
            .collect();
        if let Some(ref created_by) = self.created_by {
            params.push(("createdBy", created_by.as_str().to_owned()));
        }
        if let Some(ref subject) = self.subject {
            params.push(("subject", subject.clone()));
        }
        if self.include_all_user_records {
            params.push(("includeAllUserRecords", "true".to_owned()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        params
    }
}

/// The moderation backend.
pub trait ModerationApi: Send + Sync {
    /// The labeler this API acts as.
    fn labeler(&self) -> &Did;

    fn query_events(
        &self,
        query: &EventQuery,
    ) -> impl Future<Output = Result<Vec<ModerationEvent>, ApiError>> + Send;

    /// Emit a label event adding `add` and negating `remove` on `subject`.
    fn emit_label(
        &self,
        subject: &Subject,
        add: &[String],
        remove: &[String],
        comment: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn emit_acknowledge(
        &self,
        subject: &Subject,
        comment: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Replace the current session with a fresh login.
    fn reauthenticate(&self) -> impl Future<Output = Result<(), ApiError>> + Send;
}

#[derive(Deserialize)]
struct QueryEventsOutput {
    events: Vec<ModerationEvent>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmitEventInput<'a> {
    event: EmittedEvent,
    subject: &'a Subject,
    created_by: &'a Did,
}

/// [`ModerationApi`] over XRPC.
pub struct OzoneClient {
    session: Session,
    labeler: Did,
    /// `atproto-proxy` header value.
    proxy: String,
}

impl OzoneClient {
    pub fn new(session: Session, labeler: Did) -> Self {
        let proxy = format!("{}#atproto_labeler", labeler.as_str());
        Self {
            session,
            labeler,
            proxy,
        }
    }

    pub async fn login(&self) -> Result<Did, ApiError> {
        self.session.login().await
    }

    async fn emit(&self, event: EmittedEvent, subject: &Subject) -> Result<(), ApiError> {
        let url = xrpc_url(self.session.service(), "tools.ozone.moderation.emitEvent");
        let input = EmitEventInput {
            event,
            subject,
            created_by: &self.labeler,
        };

        let _view: IgnoredAny = self
            .session
            .send(|client| {
                client
                    .post(&url)
                    .header("atproto-proxy", &self.proxy)
                    .json(&input)
            })
            .await?;
        Ok(())
    }
}

impl ModerationApi for OzoneClient {
    fn labeler(&self) -> &Did {
        &self.labeler
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<ModerationEvent>, ApiError> {
        let url = xrpc_url(self.session.service(), "tools.ozone.moderation.queryEvents");
        let params = query.params();

        let output: QueryEventsOutput = self
            .session
            .send(|client| {
                client
                    .get(&url)
                    .header("atproto-proxy", &self.proxy)
                    .query(&params)
            })
            .await?;

        debug!("queryEvents returned {} events", output.events.len());
        Ok(output.events)
    }

    async fn emit_label(
        &self,
        subject: &Subject,
        add: &[String],
        remove: &[String],
        comment: &str,
    ) -> Result<(), ApiError> {
        let event = EmittedEvent::Label(LabelEvent {
            comment: Some(comment.to_owned()),
            create_label_vals: add.to_vec(),
            negate_label_vals: remove.to_vec(),
        });
        self.emit(event, subject).await
    }

    async fn emit_acknowledge(&self, subject: &Subject, comment: &str) -> Result<(), ApiError> {
        let event = EmittedEvent::Acknowledge(AcknowledgeEvent {
            comment: Some(comment.to_owned()),
        });
        self.emit(event, subject).await
    }

    async fn reauthenticate(&self) -> Result<(), ApiError> {
        self.session.login().await.map(drop)
    }
}
