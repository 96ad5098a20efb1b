use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::timestamp::{parse_date, parse_event_timestamp};

pub type Properties = Map<String, Value>;

/// An event as it arrives from capture. The team may not be known yet, only
/// the project token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub uuid: Uuid,
    pub distinct_id: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub site_url: String,
    #[serde(default)]
    pub team_id: Option<i32>,
    #[serde(default)]
    pub token: Option<String>,
    pub now: String,
    pub event: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
}

impl PipelineEvent {
    pub fn into_plugin_event(self, team_id: i32) -> PluginEvent {
        PluginEvent {
            uuid: self.uuid,
            distinct_id: self.distinct_id,
            ip: self.ip,
            site_url: self.site_url,
            team_id,
            now: self.now,
            event: self.event,
            properties: self.properties,
            timestamp: self.timestamp,
            offset: self.offset,
            sent_at: self.sent_at,
            elements_chain: None,
        }
    }
}

/// An event with a resolved team, the shape plugins see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    pub uuid: Uuid,
    pub distinct_id: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub site_url: String,
    pub team_id: i32,
    pub now: String,
    pub event: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements_chain: Option<String>,
}

impl PluginEvent {
    /// The server arrival time, if `now` is parseable.
    pub fn server_now(&self) -> Option<DateTime<Utc>> {
        parse_date(&self.now)
    }

    /// The timestamp this event is stored under, corrected for client clock
    /// skew using `sent_at`. Falls back to `fallback_now` when the server
    /// arrival time can't be parsed.
    pub fn resolved_timestamp(&self, fallback_now: DateTime<Utc>) -> DateTime<Utc> {
        let now = self.server_now().unwrap_or(fallback_now);
        let ignore_sent_at = self
            .properties
            .get("$ignore_sent_at")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        parse_event_timestamp(
            self.timestamp.as_deref(),
            self.offset,
            self.sent_at.as_deref().and_then(parse_date),
            ignore_sent_at,
            now,
        )
    }
}

/// An event that has been through plugins and person processing and is ready
/// to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreIngestionEvent {
    pub uuid: Uuid,
    pub event: String,
    pub distinct_id: String,
    pub team_id: i32,
    #[serde(default)]
    pub ip: Option<String>,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements_chain: Option<String>,
}

/// An event after it has been durably written, used for async side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostIngestionEvent {
    pub uuid: Uuid,
    pub event: String,
    pub distinct_id: String,
    pub team_id: i32,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements_chain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_id: Option<Uuid>,
}

/// The event an invocation started from, kept untouched for diagnostics and
/// dead lettering even after steps have transformed their copies.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OriginalEvent {
    Pipeline(PipelineEvent),
    Plugin(PluginEvent),
    PostIngestion(PostIngestionEvent),
}

impl OriginalEvent {
    pub fn uuid(&self) -> Uuid {
        match self {
            OriginalEvent::Pipeline(e) => e.uuid,
            OriginalEvent::Plugin(e) => e.uuid,
            OriginalEvent::PostIngestion(e) => e.uuid,
        }
    }

    pub fn event(&self) -> &str {
        match self {
            OriginalEvent::Pipeline(e) => &e.event,
            OriginalEvent::Plugin(e) => &e.event,
            OriginalEvent::PostIngestion(e) => &e.event,
        }
    }

    pub fn distinct_id(&self) -> &str {
        match self {
            OriginalEvent::Pipeline(e) => &e.distinct_id,
            OriginalEvent::Plugin(e) => &e.distinct_id,
            OriginalEvent::PostIngestion(e) => &e.distinct_id,
        }
    }

    pub fn team_id(&self) -> Option<i32> {
        match self {
            OriginalEvent::Pipeline(e) => e.team_id,
            OriginalEvent::Plugin(e) => Some(e.team_id),
            OriginalEvent::PostIngestion(e) => Some(e.team_id),
        }
    }

    pub fn properties(&self) -> &Properties {
        match self {
            OriginalEvent::Pipeline(e) => &e.properties,
            OriginalEvent::Plugin(e) => &e.properties,
            OriginalEvent::PostIngestion(e) => &e.properties,
        }
    }

    pub fn ip(&self) -> Option<&str> {
        match self {
            OriginalEvent::Pipeline(e) => e.ip.as_deref(),
            OriginalEvent::Plugin(e) => e.ip.as_deref(),
            OriginalEvent::PostIngestion(_) => None,
        }
    }

    pub fn site_url(&self) -> &str {
        match self {
            OriginalEvent::Pipeline(e) => &e.site_url,
            OriginalEvent::Plugin(e) => &e.site_url,
            OriginalEvent::PostIngestion(_) => "",
        }
    }

    pub fn now(&self) -> String {
        match self {
            OriginalEvent::Pipeline(e) => e.now.clone(),
            OriginalEvent::Plugin(e) => e.now.clone(),
            OriginalEvent::PostIngestion(e) => e.timestamp.to_rfc3339(),
        }
    }

    pub fn elements_chain(&self) -> Option<&str> {
        match self {
            OriginalEvent::Plugin(e) => e.elements_chain.as_deref(),
            OriginalEvent::PostIngestion(e) => e.elements_chain.as_deref(),
            OriginalEvent::Pipeline(_) => None,
        }
    }
}

impl From<PipelineEvent> for OriginalEvent {
    fn from(event: PipelineEvent) -> Self {
        OriginalEvent::Pipeline(event)
    }
}

impl From<PluginEvent> for OriginalEvent {
    fn from(event: PluginEvent) -> Self {
        OriginalEvent::Plugin(event)
    }
}

impl From<PostIngestionEvent> for OriginalEvent {
    fn from(event: PostIngestionEvent) -> Self {
        OriginalEvent::PostIngestion(event)
    }
}
