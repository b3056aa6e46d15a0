//! Wire envelope: `{type, payload}` JSON frames, both directions.
//!
//! Decoded once at the connection boundary into a closed enum, then
//! dispatched by exhaustive match — no string-keyed routing past this
//! module.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::models::{Alarm, Page, Subject};

/// A command received from a client, already separated from its envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundMessage {
    CreateAlarm(CreateAlarmPayload),
    UpdateAlarm(UpdateAlarmPayload),
    DeleteAlarm(DeleteAlarmPayload),
    TriggerAlarm(TriggerAlarmPayload),
    CreatePage(CreatePagePayload),
    SharePage(SharePagePayload),
    UnsharePage(UnsharePagePayload),
}

#[derive(Debug, Deserialize)]
pub struct CreateAlarmPayload {
    pub page_id: String,
    pub ticker: String,
    pub option: String,
    pub condition: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAlarmPayload {
    pub alarm_id: String,
    pub ticker: Option<String>,
    pub option: Option<String>,
    pub condition: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteAlarmPayload {
    pub alarm_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TriggerAlarmPayload {
    pub alarm_id: String,
    pub price: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePagePayload {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SharePagePayload {
    pub page_id: String,
    pub subject_type: SubjectKind,
    pub subject_id: String,
    pub can_view: bool,
    pub can_edit: bool,
}

#[derive(Debug, Deserialize)]
pub struct UnsharePagePayload {
    pub page_id: String,
    pub subject_type: SubjectKind,
    pub subject_id: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    User,
    Group,
}

impl SubjectKind {
    pub fn with_id(self, id: String) -> Subject {
        match self {
            SubjectKind::User => Subject::User(id),
            SubjectKind::Group => Subject::Group(id),
        }
    }
}

/// A frame sent to a client. Every variant owns its own `type` tag on
/// the wire via `#[serde(tag = "type", content = "payload")]`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    InitialState {
        user: UserSummary,
        pages: Vec<PageSummary>,
        alarms: Vec<Alarm>,
    },
    AlarmUpdate {
        alarm_id: String,
        page_id: String,
        action: AlarmAction,
        data: Value,
    },
    PageAccessGranted {
        page: PageSummary,
        alarms: Vec<Alarm>,
    },
    PageAccessRevoked {
        page_id: String,
    },
    Success {
        action: String,
        data: Value,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmAction {
    Created,
    Updated,
    Deleted,
    Triggered,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: String,
    pub username: String,
}

/// A page as seen by a specific user — includes the resolved
/// `is_owner`/`can_edit` flags that §4.1's `list_pages_visible_to` read
/// carries alongside the bare `Page` row.
#[derive(Debug, Clone, Serialize)]
pub struct PageSummary {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub is_owner: bool,
    pub can_edit: bool,
}

impl PageSummary {
    pub fn new(page: &Page, is_owner: bool, can_edit: bool) -> Self {
        Self {
            id: page.id.clone(),
            name: page.name.clone(),
            owner_id: page.owner_id.clone(),
            is_owner,
            can_edit,
        }
    }
}

impl OutboundMessage {
    pub fn into_json(self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "type": "error", "payload": { "message": "internal error" } })
        })
    }
}
