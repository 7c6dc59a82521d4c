use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

pub const CREATE_TICKET: &str = "create_ticket";
pub const PAGE_ONCALL: &str = "page_oncall";
pub const AVAILABLE_TOOLS: [&str; 2] = [CREATE_TICKET, PAGE_ONCALL];

/// One tool call lifted out of an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_call_id: Option<String>,
    pub tool_name: String,
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantInfo {
    pub name: String,
    pub phone: String,
    pub property: String,
    pub unit: String,
    pub preferred_contact_time: String,
    pub access_granted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueInfo {
    pub description: String,
    pub priority: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TicketRecord {
    pub ticket_id: String,
    pub created_at_epoch_ms: i64,
    pub created_at_iso: String,
    pub tenant: TenantInfo,
    pub issue: IssueInfo,
}

impl TicketRecord {
    pub const STATUS: &'static str = "created";

    /// Builds the `TCK-` id from the last six digits of the creation time.
    pub fn new(created_at: DateTime<Utc>, tenant: TenantInfo, issue: IssueInfo) -> Self {
        let created_at_epoch_ms = created_at.timestamp_millis();
        Self {
            ticket_id: ticket_id_for(created_at_epoch_ms),
            created_at_epoch_ms,
            created_at_iso: created_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            tenant,
            issue,
        }
    }

    /// Spreadsheet row, fixed 11-column order.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.ticket_id.clone(),
            self.created_at_iso.clone(),
            self.tenant.name.clone(),
            self.tenant.phone.clone(),
            self.tenant.property.clone(),
            self.tenant.unit.clone(),
            self.issue.description.clone(),
            self.issue.priority.clone(),
            self.tenant.preferred_contact_time.clone(),
            if self.tenant.access_granted { "Yes" } else { "No" }.to_string(),
            Self::STATUS.to_string(),
        ]
    }
}

pub fn ticket_id_for(epoch_ms: i64) -> String {
    format!("TCK-{:06}", epoch_ms.rem_euclid(1_000_000))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: Option<String>,
    pub result: Value,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub results: Vec<ToolResult>,
}
