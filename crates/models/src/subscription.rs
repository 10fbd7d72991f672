use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

use crate::Crn;

/// Subscription is a subscriber endpoint. It owns zero or more Watches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub record_id: String,
    pub name: String,
    /// Webhook URL notified on every matching delivery.
    pub target_address: String,
    /// Sent verbatim in the Authorization header of each delivery.
    pub target_token: String,
    pub expiration: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    Case,
    Incident,
    Maintenance,
    Notification,
}

impl Display for WatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            WatchKind::Case => "case",
            WatchKind::Incident => "incident",
            WatchKind::Maintenance => "maintenance",
            WatchKind::Notification => "notification",
        };
        f.write_str(s)
    }
}

impl FromStr for WatchKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "case" => Ok(WatchKind::Case),
            "incident" => Ok(WatchKind::Incident),
            "maintenance" => Ok(WatchKind::Maintenance),
            "notification" => Ok(WatchKind::Notification),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown watch kind '{0}'")]
pub struct UnknownKind(String);

/// Watch expresses a subscription's interest in one kind of event. It refers
/// to its subscription by URL only; delivery resolves the subscription at
/// use time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watch {
    pub record_id: String,
    pub subscription_url: String,
    pub kind: WatchKind,
    pub path: String,
    /// CRN masks, `*` accepted per component.
    pub crn_masks: Vec<String>,
    /// When present, restricts the watch to these specific records.
    pub record_ids: Option<Vec<String>>,
}

impl Watch {
    /// Whether any of the watch's masks matches any of the given CRNs.
    /// Unparseable masks never match.
    pub fn matches_any_crn(&self, crns: &[Crn]) -> bool {
        self.crn_masks
            .iter()
            .filter_map(|mask| mask.parse::<Crn>().ok())
            .any(|mask| crns.iter().any(|crn| crn.matches_mask(&mask)))
    }
}
