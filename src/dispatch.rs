use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::time;
use tracing::{info, warn};

use crate::{
    models::{TicketRecord, ToolInvocation, ToolResult, AVAILABLE_TOOLS, CREATE_TICKET, PAGE_ONCALL},
    normalize::NormalizedCall,
    params,
    sheets::{SheetsError, TicketSink},
};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Outcome of the best-effort ticket append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Appended,
    Skipped,
    Failed(String),
}

enum Computed {
    Ticket { record: TicketRecord, result: Value },
    Reply(Value),
}

#[derive(Clone)]
pub struct Dispatcher {
    sink: Arc<dyn TicketSink>,
    persist_timeout: Duration,
    clock: Clock,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn TicketSink>, persist_timeout: Duration) -> Self {
        Self {
            sink,
            persist_timeout,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Runs every call in order. One failing call never affects the results
    /// of the others.
    pub async fn dispatch_all(&self, calls: Vec<NormalizedCall>) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let result = match call {
                NormalizedCall::Invocation(invocation) => self.dispatch(invocation).await,
                NormalizedCall::Malformed {
                    tool_call_id,
                    reason,
                } => {
                    warn!(
                        tool_call_id = tool_call_id.as_deref().unwrap_or("-"),
                        reason = %reason,
                        "Rejecting malformed tool call"
                    );
                    ToolResult {
                        tool_call_id,
                        result: tool_error(&reason),
                    }
                }
            };
            results.push(result);
        }
        results
    }

    pub async fn dispatch(&self, invocation: ToolInvocation) -> ToolResult {
        info!(
            tool = %invocation.tool_name,
            tool_call_id = invocation.tool_call_id.as_deref().unwrap_or("-"),
            "Dispatching tool call"
        );

        let computed = panic::catch_unwind(AssertUnwindSafe(|| {
            compute(&invocation.tool_name, &invocation.parameters, (self.clock)())
        }));

        let result = match computed {
            Ok(Computed::Ticket { record, result }) => {
                self.persist(&record).await;
                result
            }
            Ok(Computed::Reply(result)) => result,
            Err(payload) => {
                let message = format!(
                    "Tool {} failed: {}",
                    invocation.tool_name,
                    panic_message(payload.as_ref())
                );
                warn!(tool = %invocation.tool_name, "{message}");
                tool_error(&message)
            }
        };

        ToolResult {
            tool_call_id: invocation.tool_call_id,
            result,
        }
    }

    /// Appends the ticket row under a time bound. Never fails the caller.
    pub async fn persist(&self, record: &TicketRecord) -> PersistOutcome {
        if !self.sink.is_configured() {
            info!(ticket_id = %record.ticket_id, "Sheets not configured, skipping ticket append");
            return PersistOutcome::Skipped;
        }

        let append = AssertUnwindSafe(self.sink.append(record)).catch_unwind();
        let result = match time::timeout(self.persist_timeout, append).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(SheetsError::Network(format!(
                "append panicked: {}",
                panic_message(payload.as_ref())
            ))),
            Err(_) => Err(SheetsError::Timeout(self.persist_timeout)),
        };

        match result {
            Ok(()) => {
                info!(ticket_id = %record.ticket_id, "Ticket appended to sheet");
                PersistOutcome::Appended
            }
            Err(err) => {
                warn!(ticket_id = %record.ticket_id, "Ticket append failed: {err}");
                PersistOutcome::Failed(err.to_string())
            }
        }
    }
}

fn compute(tool: &str, params: &Map<String, Value>, now: DateTime<Utc>) -> Computed {
    match tool {
        CREATE_TICKET => {
            let record = TicketRecord::new(now, params::tenant_from(params), params::issue_from(params));
            let result = ticket_created(&record);
            Computed::Ticket { record, result }
        }
        PAGE_ONCALL => Computed::Reply(page_oncall(params, now)),
        other => Computed::Reply(unknown_tool(other)),
    }
}

fn ticket_created(record: &TicketRecord) -> Value {
    let tenant = &record.tenant;
    json!({
        "ticket_id": record.ticket_id,
        "status": TicketRecord::STATUS,
        "timestamp": record.created_at_epoch_ms,
        "message": format!(
            "Maintenance ticket {} created for {} at {}, unit {}.",
            record.ticket_id, tenant.name, tenant.property, tenant.unit
        ),
        "success": true,
    })
}

fn page_oncall(params: &Map<String, Value>, now: DateTime<Utc>) -> Value {
    let ticket_id = params::text(params, "ticket_id");
    let unit = params::text(params, "unit");
    let priority = params::text(params, "priority");
    let property = params::text(params, "property");

    let mut message = format!("On-call technician paged for ticket {ticket_id} at {property}, unit {unit}");
    if !priority.is_empty() {
        message.push_str(&format!(" (priority: {priority})"));
    }
    message.push('.');

    json!({
        "ticket_id": ticket_id,
        "unit": unit,
        "priority": priority,
        "property": property,
        "status": "sent",
        "timestamp": now.timestamp_millis(),
        "message": message,
        "success": true,
    })
}

fn unknown_tool(name: &str) -> Value {
    json!({
        "status": "error",
        "message": format!("Unknown tool: {name}. Available tools: {}", AVAILABLE_TOOLS.join(", ")),
        "success": false,
    })
}

fn tool_error(message: &str) -> Value {
    json!({
        "status": "error",
        "message": message,
        "success": false,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "internal error".to_string()
    }
}
