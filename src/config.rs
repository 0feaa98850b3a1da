//! Application configuration.
//!
//! The raw [`AppConfig`] is what `figment` extracts from the config file and
//! environment. It is checked once at start-up by [`AppConfig::settings`];
//! anything malformed stops the process before polling begins.
use std::{
    collections::{HashMap, HashSet},
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use anyhow::{Context as _, anyhow, bail};
use atrium_api::types::string::Did;
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::models::ReportReason;

fn default_service() -> Url {
    Url::parse("https://bsky.social").expect("should be a valid url")
}

const fn default_poll_interval() -> u64 {
    30
}

const fn default_request_timeout() -> u64 {
    30
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

const fn default_listen_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3000)
}

/// Accept a list either as a sequence or as a comma-separated string.
fn comma_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum List {
        Seq(Vec<String>),
        Str(String),
    }

    let items = match List::deserialize(deserializer)? {
        List::Seq(items) => items,
        List::Str(s) => s.split(',').map(str::to_owned).collect(),
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect())
}

fn opt_comma_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    comma_list(deserializer).map(Some)
}

/// Login credentials for an account.
#[derive(Deserialize, Clone)]
pub struct Credentials {
    pub identifier: String,
    pub password: String,
    /// The account's PDS.
    #[serde(default = "default_service")]
    pub service: Url,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("password", &"<redacted>")
            .field("service", &self.service.as_str())
            .finish()
    }
}

/// The labeler account.
#[derive(Deserialize, Debug, Clone)]
pub struct LabelerConfig {
    pub did: Did,
    #[serde(flatten)]
    pub credentials: Credentials,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PrometheusConfig {
    /// The URL of the Prometheus push gateway.
    pub url: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum MetricConfig {
    PrometheusPush(PrometheusConfig),
}

/// Labels implied by each report reason.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ReportTypeLabels {
    #[serde(default, deserialize_with = "comma_list")]
    pub misleading: Vec<String>,
    #[serde(default, deserialize_with = "comma_list")]
    pub spam: Vec<String>,
    #[serde(default, deserialize_with = "comma_list")]
    pub sexual: Vec<String>,
    #[serde(default, deserialize_with = "comma_list")]
    pub rude: Vec<String>,
    #[serde(default, deserialize_with = "comma_list")]
    pub violation: Vec<String>,
    #[serde(default, deserialize_with = "comma_list")]
    pub other: Vec<String>,
}

impl ReportTypeLabels {
    /// The labels to add for a report filed with `reason`.
    pub fn labels_for(&self, reason: &ReportReason) -> &[String] {
        match *reason {
            ReportReason::Misleading => &self.misleading,
            ReportReason::Spam => &self.spam,
            ReportReason::Sexual => &self.sexual,
            ReportReason::Rude => &self.rude,
            ReportReason::Violation => &self.violation,
            ReportReason::Other => &self.other,
            ReportReason::Appeal | ReportReason::Unknown(_) => &[],
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub labeler: LabelerConfig,
    /// The account direct messages are sent from.
    pub dm: Credentials,
    /// Base URL of the Ozone UI, used for links back to reports.
    pub ozone_url: Url,
    /// Seconds between polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Seconds before an outbound request is abandoned.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(deserialize_with = "comma_list")]
    pub trusted_moderators: Vec<String>,
    #[serde(deserialize_with = "comma_list")]
    pub valid_labels: Vec<String>,
    /// Labels that count towards auto-ban thresholds. Defaults to the valid
    /// labels that are not escalation labels.
    #[serde(default, deserialize_with = "opt_comma_list")]
    pub moderation_labels: Option<Vec<String>>,
    /// `did:method` pairs, comma-separated.
    #[serde(default)]
    pub moderator_notifications: String,
    /// `label:threshold:otherCap` rules, comma-separated.
    #[serde(default)]
    pub autoban_rules: String,
    #[serde(default)]
    pub report_type_labels: ReportTypeLabels,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,
    pub metrics: Option<MetricConfig>,
}

/// An escalation rule: apply `label` to an account once its points reach
/// `threshold`. At most `other_cap` points come from labels other than `label`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoBanRule {
    pub label: String,
    pub threshold: u32,
    pub other_cap: u32,
}

impl FromStr for AutoBanRule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').map(str::trim).collect();
        let &[label, threshold, other_cap] = parts.as_slice() else {
            bail!("invalid autoban rule {s:?}, expected label:threshold:otherCap");
        };
        if label.is_empty() {
            bail!("invalid autoban rule {s:?}, label is empty");
        }

        Ok(Self {
            label: label.to_owned(),
            threshold: threshold
                .parse()
                .with_context(|| format!("invalid threshold in autoban rule {s:?}"))?,
            other_cap: other_cap
                .parse()
                .with_context(|| format!("invalid cap in autoban rule {s:?}"))?,
        })
    }
}

/// Parse a comma-separated list of auto-ban rules.
pub fn parse_autoban_rules(s: &str) -> anyhow::Result<Vec<AutoBanRule>> {
    s.split(',')
        .filter(|r| !r.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// How a moderator wants to hear about failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationMethod {
    DirectMessage,
}

/// Parse `did:method` pairs. The method follows the last colon. Entries with an
/// unknown method are skipped.
pub fn parse_notification_preferences(
    s: &str,
) -> anyhow::Result<HashMap<Did, NotificationMethod>> {
    let mut prefs = HashMap::new();
    for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((did, method)) = entry.rsplit_once(':') else {
            bail!("invalid notification preference {entry:?}, expected did:method");
        };
        let did = Did::new(did.to_owned())
            .map_err(|e| anyhow!("invalid DID in notification preference {entry:?}: {e}"))?;

        match method {
            "dm" => {
                let _previous = prefs.insert(did, NotificationMethod::DirectMessage);
            }
            m => tracing::warn!("ignoring unknown notification method {m:?} for {}", did.as_str()),
        }
    }
    Ok(prefs)
}

/// Validated configuration used by the pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    pub labeler: Did,
    pub ozone_url: Url,
    pub trusted_moderators: HashSet<Did>,
    pub valid_labels: HashSet<String>,
    pub moderation_labels: HashSet<String>,
    pub notification_preferences: HashMap<Did, NotificationMethod>,
    pub autoban_rules: Vec<AutoBanRule>,
    pub report_type_labels: ReportTypeLabels,
}

impl AppConfig {
    /// Validate the raw configuration.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let trusted_moderators = self
            .trusted_moderators
            .iter()
            .map(|d| {
                Did::new(d.clone()).map_err(|e| anyhow!("invalid trusted moderator {d:?}: {e}"))
            })
            .collect::<anyhow::Result<HashSet<_>>>()?;

        let autoban_rules =
            parse_autoban_rules(&self.autoban_rules).context("failed to parse autoban rules")?;

        let moderation_labels = match self.moderation_labels {
            Some(ref labels) => labels.iter().cloned().collect(),
            None => self
                .valid_labels
                .iter()
                .filter(|l| !autoban_rules.iter().any(|r| &r.label == *l))
                .cloned()
                .collect(),
        };

        Ok(Settings {
            labeler: self.labeler.did.clone(),
            ozone_url: self.ozone_url.clone(),
            trusted_moderators,
            valid_labels: self.valid_labels.iter().cloned().collect(),
            moderation_labels,
            notification_preferences: parse_notification_preferences(
                &self.moderator_notifications,
            )
            .context("failed to parse moderator notifications")?,
            autoban_rules,
            report_type_labels: self.report_type_labels.clone(),
        })
    }
}
