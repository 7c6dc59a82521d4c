// Every lookup falls back to a default; keys drifted between assistant configs.

use serde_json::{Map, Value};

use crate::models::{IssueInfo, TenantInfo};

const TENANT_SECTIONS: [&str; 2] = ["tenant_info", "tenant"];
const ISSUE_SECTIONS: [&str; 2] = ["issue_info", "issue"];

pub fn tenant_from(params: &Map<String, Value>) -> TenantInfo {
    let section = nested(params, &TENANT_SECTIONS);
    let lookup = |keys: &[&str]| text_in(section, params, keys);

    TenantInfo {
        name: lookup(&["name", "tenant_name"]),
        phone: lookup(&["phone", "tenant_phone", "phone_number"]),
        property: lookup(&["property", "property_name"]),
        unit: lookup(&["unit", "unit_number"]),
        preferred_contact_time: lookup(&["preferred_contact_time", "contact_time"]),
        access_granted: flag_in(section, params, &["access_granted", "permission_to_enter"]),
    }
}

pub fn issue_from(params: &Map<String, Value>) -> IssueInfo {
    let section = nested(params, &ISSUE_SECTIONS);

    IssueInfo {
        description: text_in(section, params, &["description", "issue_description", "issue"]),
        priority: text_in(section, params, &["priority", "issue_priority"]),
    }
}

/// Top-level string field, empty when absent.
pub fn text(params: &Map<String, Value>, key: &str) -> String {
    params.get(key).and_then(as_text).unwrap_or_default()
}

fn nested<'a>(params: &'a Map<String, Value>, sections: &[&str]) -> Option<&'a Map<String, Value>> {
    sections
        .iter()
        .find_map(|section| params.get(*section).and_then(Value::as_object))
}

fn text_in(section: Option<&Map<String, Value>>, params: &Map<String, Value>, keys: &[&str]) -> String {
    section
        .and_then(|s| first_text(s, keys))
        .or_else(|| first_text(params, keys))
        .unwrap_or_default()
}

fn first_text(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key).and_then(as_text))
        .find(|value| !value.is_empty())
}

fn flag_in(section: Option<&Map<String, Value>>, params: &Map<String, Value>, keys: &[&str]) -> bool {
    section
        .and_then(|s| first_flag(s, keys))
        .or_else(|| first_flag(params, keys))
        .unwrap_or(false)
}

fn first_flag(map: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| map.get(*key).and_then(as_flag))
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => Some(matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y"
        )),
        _ => None,
    }
}
