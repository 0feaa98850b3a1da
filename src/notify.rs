//! Failure notifications to moderators.
//!
//! At most one notification is sent per report, across restarts: a report id
//! is checked against this run's session set and then the persisted store.
//! Only notifications that were actually delivered are recorded.
use std::collections::{HashMap, HashSet};

use atrium_api::types::string::Did;
use metrics::counter;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    chat::{LinkFacet, MessagingGateway},
    config::{NotificationMethod, Settings},
    metrics::NOTIFICATIONS_SENT,
    models::Subject,
    storage::PersistedSet,
};

/// What happened to a notification request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// This report was already notified.
    Duplicate,
    /// The moderator has no preference and is not trusted.
    NoRecipient,
    /// The gateway failed; nothing was recorded.
    Failed,
}

pub struct Notifier<G> {
    gateway: G,
    ozone_url: Url,
    preferences: HashMap<Did, NotificationMethod>,
    trusted: HashSet<Did>,
    session: HashSet<String>,
    notified: PersistedSet<String>,
}

impl<G: MessagingGateway> Notifier<G> {
    pub fn new(gateway: G, settings: &Settings, notified: PersistedSet<String>) -> Self {
        Self {
            gateway,
            ozone_url: settings.ozone_url.clone(),
            preferences: settings.notification_preferences.clone(),
            trusted: settings.trusted_moderators.clone(),
            session: HashSet::new(),
            notified,
        }
    }

    /// Deep link to the report in the Ozone UI.
    pub fn report_link(&self, subject: &Subject) -> String {
        let key: String =
            url::form_urlencoded::byte_serialize(subject.quick_open_key().as_bytes()).collect();
        format!(
            "{}/reports?quickOpen={key}",
            self.ozone_url.as_str().trim_end_matches('/')
        )
    }

    fn method_for(&self, moderator: &Did) -> Option<NotificationMethod> {
        self.preferences.get(moderator).copied().or_else(|| {
            self.trusted.contains(moderator).then(|| {
                debug!(
                    "using default DM preference for trusted moderator {}",
                    moderator.as_str()
                );
                NotificationMethod::DirectMessage
            })
        })
    }

    /// Tell `moderator` that labeling for report `report_id` failed.
    pub async fn notify_failure(
        &mut self,
        moderator: &Did,
        summary: &str,
        subject: &Subject,
        report_id: i64,
    ) -> Delivery {
        let key = report_id.to_string();
        if self.session.contains(&key) || self.notified.contains(&key) {
            debug!("already notified about report {report_id}, skipping");
            return Delivery::Duplicate;
        }

        let Some(method) = self.method_for(moderator) else {
            info!(
                "no notification preference for {} and not trusted",
                moderator.as_str()
            );
            return Delivery::NoRecipient;
        };

        let link = self.report_link(subject);
        let message = format!("❌ Auto-label failed: {summary}\n\nReport: {link}");
        let facets: Vec<LinkFacet> = LinkFacet::last_in(&message, &link).into_iter().collect();

        let sent = match method {
            NotificationMethod::DirectMessage => {
                self.gateway
                    .send_direct_message(moderator, &message, &facets)
                    .await
            }
        };

        match sent {
            Ok(()) => {
                counter!(NOTIFICATIONS_SENT).increment(1);
                let _fresh = self.session.insert(key.clone());
                if let Err(e) = self.notified.add(key) {
                    warn!("failed to persist notification for report {report_id}: {e:#}");
                }
                Delivery::Sent
            }
            Err(e) => {
                warn!(
                    "failed to notify {} about report {report_id}: {e}",
                    moderator.as_str()
                );
                Delivery::Failed
            }
        }
    }
}
