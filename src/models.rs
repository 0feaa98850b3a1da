//! Ozone moderation data model.
//!
//! Reference: <https://github.com/bluesky-social/atproto/tree/main/lexicons/tools/ozone/moderation>
use std::fmt;

use atrium_api::types::string::{Datetime, Did};
use serde::{Deserialize, Serialize};

/// `$type` of a report event.
pub(crate) const REPORT_EVENT_TYPE: &str = "tools.ozone.moderation.defs#modEventReport";
/// `$type` of a label event.
pub(crate) const LABEL_EVENT_TYPE: &str = "tools.ozone.moderation.defs#modEventLabel";

/// A reference to a specific revision of a post.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRef {
    /// `at://<did>/<collection>/<rkey>`
    pub uri: String,
    pub cid: String,
}

impl PostRef {
    /// The DID in the authority segment of the post's uri, if it is one.
    pub fn author(&self) -> Option<Did> {
        let authority = self.uri.strip_prefix("at://")?.split('/').next()?;
        Did::new(authority.to_owned()).ok()
    }
}

/// A reference to an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRef {
    pub did: Did,
}

/// The subject of a moderation event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum Subject {
    #[serde(rename = "com.atproto.repo.strongRef")]
    Post(PostRef),
    #[serde(rename = "com.atproto.admin.defs#repoRef")]
    Account(AccountRef),
    /// Message references and anything newer than this client knows about.
    #[serde(other)]
    Unsupported,
}

impl Subject {
    pub fn account(did: Did) -> Self {
        Self::Account(AccountRef { did })
    }

    /// The account this subject belongs to.
    pub fn account_did(&self) -> Option<Did> {
        match *self {
            Self::Account(ref account) => Some(account.did.clone()),
            Self::Post(ref post) => post.author(),
            Self::Unsupported => None,
        }
    }

    /// The identifier Ozone uses to open this subject (`quickOpen`).
    pub fn quick_open_key(&self) -> &str {
        match *self {
            Self::Account(ref account) => account.did.as_str(),
            Self::Post(ref post) => &post.uri,
            Self::Unsupported => "",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Post(ref post) => write!(f, "post {} ({})", post.uri, post.cid),
            Self::Account(ref account) => write!(f, "account {}", account.did.as_str()),
            Self::Unsupported => f.write_str("unsupported subject"),
        }
    }
}

/// Whether a report was filed against a post or an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportType {
    Post,
    Account,
}

impl From<&Subject> for ReportType {
    fn from(subject: &Subject) -> Self {
        match *subject {
            Subject::Account(_) => Self::Account,
            Subject::Post(_) | Subject::Unsupported => Self::Post,
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Post => "post",
            Self::Account => "account",
        })
    }
}

/// The reason a reporter selected.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum ReportReason {
    Spam,
    Violation,
    Misleading,
    Sexual,
    Rude,
    Other,
    Appeal,
    Unknown(String),
}

impl From<String> for ReportReason {
    fn from(reason: String) -> Self {
        match reason
            .strip_prefix("com.atproto.moderation.defs#")
            .unwrap_or(&reason)
        {
            "reasonSpam" => Self::Spam,
            "reasonViolation" => Self::Violation,
            "reasonMisleading" => Self::Misleading,
            "reasonSexual" => Self::Sexual,
            "reasonRude" => Self::Rude,
            "reasonOther" => Self::Other,
            "reasonAppeal" => Self::Appeal,
            _ => Self::Unknown(reason),
        }
    }
}

impl fmt::Display for ReportReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::Spam => "reasonSpam",
            Self::Violation => "reasonViolation",
            Self::Misleading => "reasonMisleading",
            Self::Sexual => "reasonSexual",
            Self::Rude => "reasonRude",
            Self::Other => "reasonOther",
            Self::Appeal => "reasonAppeal",
            Self::Unknown(ref s) => return f.write_str(s),
        };
        write!(f, "com.atproto.moderation.defs#{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEvent {
    #[serde(default)]
    pub comment: Option<String>,
    pub report_type: ReportReason,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub create_label_vals: Vec<String>,
    #[serde(default)]
    pub negate_label_vals: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// The kinds of moderation event this agent reads or writes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "$type")]
pub enum EventKind {
    #[serde(rename = "tools.ozone.moderation.defs#modEventReport")]
    Report(ReportEvent),
    #[serde(rename = "tools.ozone.moderation.defs#modEventLabel")]
    Label(LabelEvent),
    #[serde(rename = "tools.ozone.moderation.defs#modEventAcknowledge")]
    Acknowledge(AcknowledgeEvent),
    #[serde(other)]
    Other,
}

/// An event emitted by this agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "$type")]
pub enum EmittedEvent {
    #[serde(rename = "tools.ozone.moderation.defs#modEventLabel")]
    Label(LabelEvent),
    #[serde(rename = "tools.ozone.moderation.defs#modEventAcknowledge")]
    Acknowledge(AcknowledgeEvent),
}

/// `tools.ozone.moderation.defs#modEventView`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationEvent {
    pub id: i64,
    pub event: EventKind,
    pub subject: Subject,
    pub created_by: Did,
    #[serde(default)]
    pub creator_handle: Option<String>,
    pub created_at: Datetime,
}

impl ModerationEvent {
    /// The report payload, if this is a report.
    pub fn report(&self) -> Option<&ReportEvent> {
        match self.event {
            EventKind::Report(ref report) => Some(report),
            _ => None,
        }
    }

    /// A human readable name for the event creator.
    pub fn creator_name(&self) -> &str {
        self.creator_handle
            .as_deref()
            .unwrap_or_else(|| self.created_by.as_str())
    }
}
