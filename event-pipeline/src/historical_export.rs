//! Re-emitting stored events through the async handlers path.
//!
//! Downstream stores deduplicate on a key built from `event`, `uuid`,
//! `distinct_id` and the timestamp, so a replayed payload has to carry those
//! exactly as they were stored. Replays only add properties, they never
//! change existing fields.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::{PluginEvent, Properties};

pub const IS_HISTORICAL_EXPORT_EVENT: &str = "$$is_historical_export_event";
pub const HISTORICAL_EXPORT_TIMESTAMP: &str = "$$historical_export_timestamp";
pub const HISTORICAL_EXPORT_SOURCE_DB: &str = "$$historical_export_source_db";
pub const SOURCE_DB: &str = "clickhouse";

/// An event as it was durably written. `timestamp` is already corrected for
/// client clock skew.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub uuid: Uuid,
    pub event: String,
    #[serde(default)]
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
    pub team_id: i32,
    pub distinct_id: String,
    #[serde(default)]
    pub elements_chain: String,
    pub created_at: DateTime<Utc>,
}

/// Build the replay payload for one stored event.
///
/// Everything but `$$historical_export_timestamp` depends only on the stored
/// event, so replaying the same event twice differs in that one property.
/// Marker properties the stored event already carries are left as they are.
pub fn to_historical_plugin_event(stored: &StoredEvent, exported_at: DateTime<Utc>) -> PluginEvent {
    let mut properties = stored.properties.clone();
    let markers = [
        (IS_HISTORICAL_EXPORT_EVENT, Value::Bool(true)),
        (
            HISTORICAL_EXPORT_TIMESTAMP,
            Value::String(exported_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        ),
        (
            HISTORICAL_EXPORT_SOURCE_DB,
            Value::String(SOURCE_DB.to_string()),
        ),
    ];
    for (key, value) in markers {
        properties.entry(key).or_insert(value);
    }

    PluginEvent {
        uuid: stored.uuid,
        distinct_id: stored.distinct_id.clone(),
        ip: None,
        site_url: String::new(),
        team_id: stored.team_id,
        now: stored
            .created_at
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        event: stored.event.clone(),
        properties,
        timestamp: Some(
            stored
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        ),
        // The stored timestamp is already skew corrected, applying sent_at
        // again would shift it
        offset: None,
        sent_at: None,
        elements_chain: (!stored.elements_chain.is_empty()).then(|| stored.elements_chain.clone()),
    }
}

/// A request to replay one team's events from a time range. `date_to` is
/// exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalExportRequest {
    pub team_id: i32,
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
}

impl HistoricalExportRequest {
    pub fn covers(&self, event: &StoredEvent) -> bool {
        event.team_id == self.team_id
            && event.timestamp >= self.date_from
            && event.timestamp < self.date_to
    }

    /// Payloads for the covered events, in input order.
    pub fn replay<'a>(
        &self,
        events: impl IntoIterator<Item = &'a StoredEvent>,
        exported_at: DateTime<Utc>,
    ) -> Vec<PluginEvent> {
        events
            .into_iter()
            .filter(|event| self.covers(event))
            .map(|event| to_historical_plugin_event(event, exported_at))
            .collect()
    }
}
