use serde::Serialize;

/// Either a user or a group, as the grantee of a permission row.
///
/// Stored as two columns (`subject_type`, `subject_id`) at the SQL
/// boundary (see `storage::mod`); exposed as this sum type everywhere
/// else.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    User(String),
    Group(String),
}

impl Subject {
    pub fn kind(&self) -> &'static str {
        match self {
            Subject::User(_) => "user",
            Subject::Group(_) => "group",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Subject::User(id) | Subject::Group(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: &str) -> Option<Self> {
        match kind {
            "user" => Some(Subject::User(id.to_string())),
            "group" => Some(Subject::Group(id.to_string())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Group {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Page {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PagePermissionRow {
    pub page_id: String,
    pub subject_type: String,
    pub subject_id: String,
    pub can_view: bool,
    pub can_edit: bool,
}

#[derive(Debug, Clone)]
pub struct PagePermission {
    pub page_id: String,
    pub subject: Subject,
    pub can_view: bool,
    pub can_edit: bool,
}

impl From<PagePermissionRow> for PagePermission {
    fn from(row: PagePermissionRow) -> Self {
        let subject = Subject::from_parts(&row.subject_type, &row.subject_id)
            .unwrap_or(Subject::User(row.subject_id));
        Self {
            page_id: row.page_id,
            subject,
            can_view: row.can_view,
            can_edit: row.can_edit,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Alarm {
    pub id: String,
    pub page_id: String,
    pub ticker: String,
    pub option: String,
    pub condition: String,
    pub created_by: String,
    pub active: bool,
    pub created_at: String,
    pub last_triggered: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AlarmEvent {
    pub id: String,
    pub alarm_id: String,
    pub triggered_by: String,
    pub price: Option<f64>,
    pub triggered_at: String,
}

/// The read used to build the `initial_state`/`page_access_granted`
/// frames: a page paired with the resolved ownership/edit flags for
/// one specific viewer.
#[derive(Debug, Clone)]
pub struct VisiblePage {
    pub page: Page,
    pub is_owner: bool,
    pub can_edit: bool,
}
