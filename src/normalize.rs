use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::ToolInvocation;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeShape {
    Batch,
    Singular,
}

impl EnvelopeShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Singular => "singular",
        }
    }
}

/// One entry of a recognized envelope. Entries that cannot be turned into an
/// invocation keep their slot so the caller still answers their id.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedCall {
    Invocation(ToolInvocation),
    Malformed {
        tool_call_id: Option<String>,
        reason: String,
    },
}

impl NormalizedCall {
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::Invocation(invocation) => invocation.tool_call_id.as_deref(),
            Self::Malformed { tool_call_id, .. } => tool_call_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub shape: EnvelopeShape,
    pub calls: Vec<NormalizedCall>,
}

/// Decodes the raw request body. Empty bodies decode to `{}`; a body that is
/// itself a JSON string is decoded once more.
pub fn decode_body(raw: &[u8]) -> Result<Value, NormalizeError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }

    let value = serde_json::from_slice::<Value>(raw)
        .map_err(|err| NormalizeError::InvalidJson(err.to_string()))?;

    match value {
        Value::String(inner) => serde_json::from_str::<Value>(&inner)
            .map_err(|err| NormalizeError::InvalidJson(err.to_string())),
        other => Ok(other),
    }
}

/// Envelope recognition. Batch form is checked before singular form; `None`
/// means the body carried no actionable tool call.
pub fn normalize(body: &Value) -> Option<Normalized> {
    if let Some(calls) = from_batch(body) {
        return Some(Normalized {
            shape: EnvelopeShape::Batch,
            calls,
        });
    }

    from_singular(body).map(|call| Normalized {
        shape: EnvelopeShape::Singular,
        calls: vec![call],
    })
}

fn from_batch(body: &Value) -> Option<Vec<NormalizedCall>> {
    let message = body.get("message")?;
    if message.get("type").and_then(Value::as_str) != Some("tool-calls") {
        return None;
    }

    let entries = message.get("toolCalls").and_then(Value::as_array)?;
    if entries.is_empty() {
        return None;
    }

    Some(entries.iter().map(batch_entry).collect())
}

fn batch_entry(entry: &Value) -> NormalizedCall {
    let tool_call_id = entry.get("id").and_then(id_text);

    if let Some(call_type) = entry.get("type").filter(|t| !t.is_null()) {
        if call_type.as_str() != Some("function") {
            return NormalizedCall::Malformed {
                tool_call_id,
                reason: format!("Unsupported tool call type: {call_type}"),
            };
        }
    }

    let Some(function) = entry.get("function").and_then(Value::as_object) else {
        return NormalizedCall::Malformed {
            tool_call_id,
            reason: "Tool call has no function".to_string(),
        };
    };

    let Some(name) = function.get("name").and_then(Value::as_str) else {
        return NormalizedCall::Malformed {
            tool_call_id,
            reason: "Tool call function has no name".to_string(),
        };
    };

    NormalizedCall::Invocation(ToolInvocation {
        tool_call_id,
        tool_name: name.to_string(),
        parameters: function
            .get("arguments")
            .map(parameters_from)
            .unwrap_or_default(),
    })
}

fn from_singular(body: &Value) -> Option<NormalizedCall> {
    if body.get("type").and_then(Value::as_str) != Some("tool-call") {
        return None;
    }
    let call = body.get("toolCall").and_then(Value::as_object)?;
    let tool_call_id = call.get("id").and_then(id_text);

    let Some(name) = call.get("name").and_then(Value::as_str) else {
        return Some(NormalizedCall::Malformed {
            tool_call_id,
            reason: "Tool call has no name".to_string(),
        });
    };

    let raw = call
        .get("arguments")
        .filter(|v| !v.is_null())
        .or_else(|| call.get("parameters"));

    Some(NormalizedCall::Invocation(ToolInvocation {
        tool_call_id,
        tool_name: name.to_string(),
        parameters: raw.map(parameters_from).unwrap_or_default(),
    }))
}

/// Ids are echoed as given; non-string ids are echoed as their JSON text.
fn id_text(id: &Value) -> Option<String> {
    match id {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Arguments may be a mapping or a JSON-encoded string of one. Anything else,
/// including a string that fails to parse, becomes an empty mapping.
fn parameters_from(raw: &Value) -> Map<String, Value> {
    match raw {
        Value::Object(map) => map.clone(),
        Value::String(encoded) => match serde_json::from_str::<Value>(encoded) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}
