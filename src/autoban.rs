//! Automatic escalation of repeatedly labeled accounts.
//!
//! Each moderation label an account carries is worth one point. A rule fires
//! when the points for its own label plus the (capped) points for every other
//! moderation label reach its threshold, and the rule's label is then applied
//! to the account.
use std::collections::{HashMap, HashSet};

use atrium_api::types::string::Did;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::{
    command::Action,
    config::{AutoBanRule, Settings},
    metrics::AUTOBAN_ESCALATIONS,
    models::{EventKind, ModerationEvent, Subject},
    ozone::{EventQuery, ModerationApi},
    retry::{self, RetryPolicy},
};

/// Labels with this prefix mark reports, not moderation decisions.
const REPORT_LABEL_PREFIX: &str = "report:";

/// Comment attached to escalation labels.
const ESCALATION_COMMENT: &str = "Auto-applied due to threshold violation";

/// Net count of each label on an account.
pub type LabelTally = HashMap<String, u32>;

/// Points a rule scored against a tally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Score {
    pub primary: u32,
    pub other: u32,
}

impl Score {
    pub const fn total(self) -> u32 {
        self.primary.saturating_add(self.other)
    }
}

/// Count the labels applied to `account` (directly or on its posts) by the
/// label events in `events`, oldest first. A removal never takes a count below
/// zero.
pub fn tally(events: &[ModerationEvent], account: &Did) -> LabelTally {
    let mut events: Vec<&ModerationEvent> = events
        .iter()
        .filter(|e| e.subject.account_did().as_ref() == Some(account))
        .collect();
    events.sort_by_key(|e| e.id);

    let mut counts = LabelTally::new();
    for event in events {
        let EventKind::Label(ref label) = event.event else {
            continue;
        };

        for val in label
            .create_label_vals
            .iter()
            .filter(|l| !l.starts_with(REPORT_LABEL_PREFIX))
        {
            *counts.entry(val.clone()).or_default() += 1;
        }
        for val in label
            .negate_label_vals
            .iter()
            .filter(|l| !l.starts_with(REPORT_LABEL_PREFIX))
        {
            let count = counts.entry(val.clone()).or_default();
            *count = count.saturating_sub(1);
        }
    }

    counts
}

pub struct AutoBan {
    rules: Vec<AutoBanRule>,
    /// Labels that earn points and trigger a check when applied.
    moderation_labels: HashSet<String>,
}

impl AutoBan {
    pub const fn new(rules: Vec<AutoBanRule>, moderation_labels: HashSet<String>) -> Self {
        Self {
            rules,
            moderation_labels,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.autoban_rules.clone(),
            settings.moderation_labels.clone(),
        )
    }

    pub fn score(&self, rule: &AutoBanRule, tally: &LabelTally) -> Score {
        let primary = tally.get(&rule.label).copied().unwrap_or(0);
        let other = self
            .moderation_labels
            .iter()
            .filter(|l| **l != rule.label)
            .filter_map(|l| tally.get(l))
            .fold(0_u32, |acc, n| acc.saturating_add(*n));

        Score {
            primary,
            other: other.min(rule.other_cap),
        }
    }

    /// The rules whose thresholds `tally` meets.
    pub fn fired<'a>(&'a self, tally: &LabelTally) -> Vec<&'a AutoBanRule> {
        self.rules
            .iter()
            .filter(|rule| {
                let score = self.score(rule, tally);
                debug!(
                    "auto-ban check for {}: {} primary + {} other (cap {}) = {}/{}",
                    rule.label,
                    score.primary,
                    score.other,
                    rule.other_cap,
                    score.total(),
                    rule.threshold
                );
                score.total() >= rule.threshold
            })
            .collect()
    }

    /// Re-evaluate `account` after `applied_label` was added to it or one of its
    /// posts, applying every escalation label whose rule fires. Returns the
    /// escalation labels applied. Never fails; problems are logged.
    pub async fn check_thresholds<M: ModerationApi>(
        &self,
        api: &M,
        policy: &RetryPolicy,
        applied_label: &str,
        account: &Did,
    ) -> Vec<String> {
        if self.rules.is_empty() || !self.moderation_labels.contains(applied_label) {
            return Vec::new();
        }

        info!(
            "checking auto-ban thresholds for {} after applying {applied_label}",
            account.as_str()
        );

        let history = match api
            .query_events(&EventQuery::label_history(api.labeler(), account))
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(
                    "failed to query moderation history for {}: {e}",
                    account.as_str()
                );
                return Vec::new();
            }
        };

        let tally = tally(&history, account);
        debug!("label tally for {}: {tally:?}", account.as_str());

        let subject = Subject::account(account.clone());
        let mut applied = Vec::new();
        for rule in self.fired(&tally) {
            info!(
                "applying auto-ban label {} to {}",
                rule.label,
                account.as_str()
            );
            match retry::emit_label(
                api,
                policy,
                &subject,
                Action::Add,
                &rule.label,
                ESCALATION_COMMENT,
            )
            .await
            {
                Ok(()) => {
                    counter!(AUTOBAN_ESCALATIONS).increment(1);
                    applied.push(rule.label.clone());
                }
                Err(e) => warn!(
                    "failed to apply auto-ban label {} to {}: {e}",
                    rule.label,
                    account.as_str()
                ),
            }
        }

        applied
    }
}
