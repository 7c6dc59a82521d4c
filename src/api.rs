use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    models::BatchResponse,
    normalize::{decode_body, normalize},
    AppState,
};

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

/// Configuration presence flags for operators. Only booleans and the sheet
/// name are reported, never credential values.
pub async fn diagnostics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let config = &state.config;

    Json(json!({
        "status": "success",
        "message": "VAPI Webhook is running!",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "environment": {
            "hasGoogleSheetsKey": config.sheets_api_key.is_some(),
            "hasServiceAccount": config.service_account_key.is_some(),
            "hasSpreadsheetId": config.spreadsheet_id.is_some(),
            "sheetName": config.sheet_name,
        },
        "endpoint": format!("{host}/api/vapi/events"),
    }))
}

pub async fn method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "Method not allowed" })),
    )
}

pub async fn vapi_events(State(state): State<AppState>, body: Bytes) -> Response {
    let trace_id = Uuid::new_v4();
    handle_event(state, body)
        .instrument(info_span!("vapi_event", trace_id = %trace_id))
        .await
}

async fn handle_event(state: AppState, body: Bytes) -> Response {
    if state.config.dev_log_payloads {
        debug!(payload = %String::from_utf8_lossy(&body), "Inbound webhook payload");
    }

    let value = match decode_body(&body) {
        Ok(value) => value,
        Err(err) => {
            warn!("Rejecting webhook body: {err}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid JSON" })),
            )
                .into_response();
        }
    };

    let Some(normalized) = normalize(&value) else {
        debug!("No tool call in webhook body, acknowledging");
        return (StatusCode::OK, Json(json!({ "ok": true }))).into_response();
    };

    info!(
        shape = normalized.shape.as_str(),
        tool_calls = normalized.calls.len(),
        "Normalized tool call envelope"
    );

    let mut results = state.dispatcher.dispatch_all(normalized.calls).await;
    if results.len() == 1 {
        let single = results.remove(0);
        return (StatusCode::OK, Json(single)).into_response();
    }

    (StatusCode::OK, Json(BatchResponse { results })).into_response()
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::Body,
        http::{Method, Request},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        build_router,
        config::Config,
        dispatch::Dispatcher,
        models::TicketRecord,
        sheets::{SheetsError, SheetsSink, SinkFuture, TicketSink},
    };

    struct FailingSink;

    impl TicketSink for FailingSink {
        fn is_configured(&self) -> bool {
            true
        }

        fn append<'a>(&'a self, _record: &'a TicketRecord) -> SinkFuture<'a> {
            Box::pin(async { Err::<(), _>(SheetsError::Network("connection refused".to_string())) })
        }
    }

    fn state_with(sink: Arc<dyn TicketSink>, vars: &[(&str, &str)]) -> AppState {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Config::from_lookup(|key| {
            vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        });
        AppState {
            dispatcher: Dispatcher::new(sink, Duration::from_millis(200)),
            config,
        }
    }

    fn default_state() -> AppState {
        state_with(Arc::new(SheetsSink::new(None)), &[])
    }

    async fn send(state: AppState, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        send_bytes(state, method, uri, body.as_bytes().to_vec()).await
    }

    async fn send_bytes(
        state: AppState,
        method: Method,
        uri: &str,
        body: Vec<u8>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();

        let response = build_router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn post(state: AppState, body: &str) -> (StatusCode, Value) {
        send(state, Method::POST, "/api/vapi/events", body).await
    }

    #[tokio::test]
    async fn non_tool_bodies_are_acknowledged() {
        for body in [
            "{}",
            r#"{"type":"status-update"}"#,
            r#"{"message":{"type":"end-of-call-report"}}"#,
            "",
        ] {
            let (status, value) = post(default_state(), body).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(value, json!({ "ok": true }));
        }
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        for body in ["{not json", r#""{still not json""#] {
            let (status, value) = post(default_state(), body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(value["error"], "Invalid JSON");
        }
    }

    #[tokio::test]
    async fn non_utf8_body_is_rejected() {
        let body = b"{\"type\":\"tool-call\",\"toolCall\":{\"id\":\"\xFF\"}}".to_vec();
        let (status, value) = send_bytes(default_state(), Method::POST, "/api/vapi/events", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["error"], "Invalid JSON");
    }

    #[tokio::test]
    async fn other_methods_get_405() {
        for method in [Method::GET, Method::PUT, Method::DELETE, Method::PATCH] {
            let (status, value) = send(default_state(), method, "/api/vapi/events", "").await;
            assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(value["error"], "Method not allowed");
        }
    }

    #[tokio::test]
    async fn options_preflight_returns_cors_headers() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/vapi/events")
            .header("origin", "https://dashboard.vapi.ai")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();

        let response = build_router(default_state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["access-control-allow-origin"], "*");
        let methods = headers["access-control-allow-methods"].to_str().unwrap();
        for method in ["GET", "POST", "PUT", "DELETE", "OPTIONS"] {
            assert!(methods.contains(method), "missing {method} in {methods}");
        }
        let allowed = headers["access-control-allow-headers"]
            .to_str()
            .unwrap()
            .to_ascii_lowercase();
        for name in ["content-type", "authorization", "x-requested-with", "accept", "origin"] {
            assert!(allowed.contains(name), "missing {name} in {allowed}");
        }
    }

    #[tokio::test]
    async fn singular_tool_call_returns_result_object() {
        let body = json!({
            "type": "tool-call",
            "toolCall": {
                "id": "call-1",
                "name": "create_ticket",
                "arguments": { "name": "Jane", "unit": "4B", "property": "Oak Apartments" }
            }
        });
        let (status, value) = post(default_state(), &body.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["toolCallId"], "call-1");
        assert_eq!(value["result"]["status"], "created");
        assert!(value.get("results").is_none());
    }

    #[tokio::test]
    async fn unknown_tool_is_still_200() {
        let body = json!({
            "type": "tool-call",
            "toolCall": { "id": "call-9", "name": "foo", "parameters": {} }
        });
        let (status, value) = post(default_state(), &body.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["result"]["status"], "error");
        assert_eq!(value["result"]["success"], false);
    }

    #[tokio::test]
    async fn batch_returns_results_in_order_despite_sheet_failure() {
        let body = json!({
            "message": {
                "type": "tool-calls",
                "toolCalls": [
                    {
                        "id": "first",
                        "type": "function",
                        "function": {
                            "name": "create_ticket",
                            "arguments": "{\"name\":\"Jane\",\"unit\":\"4B\"}"
                        }
                    },
                    {
                        "id": "second",
                        "type": "function",
                        "function": {
                            "name": "page_oncall",
                            "arguments": { "ticket_id": "TCK-123456", "property": "Oak", "unit": "4B" }
                        }
                    }
                ]
            }
        });
        let state = state_with(Arc::new(FailingSink), &[]);
        let (status, value) = post(state, &body.to_string()).await;
        assert_eq!(status, StatusCode::OK);

        let results = value["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["toolCallId"], "first");
        assert_eq!(results[0]["result"]["success"], true);
        assert_eq!(results[1]["toolCallId"], "second");
        assert_eq!(results[1]["result"]["status"], "sent");
    }

    #[tokio::test]
    async fn malformed_batch_entry_is_answered_in_place() {
        let body = json!({
            "message": {
                "type": "tool-calls",
                "toolCalls": [
                    {
                        "id": "good",
                        "type": "function",
                        "function": { "name": "create_ticket", "arguments": { "name": "Jane" } }
                    },
                    { "id": 7, "type": "function", "function": { "arguments": {} } }
                ]
            }
        });
        let (status, value) = post(default_state(), &body.to_string()).await;
        assert_eq!(status, StatusCode::OK);

        let results = value["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["toolCallId"], "good");
        assert_eq!(results[0]["result"]["success"], true);
        assert_eq!(results[1]["toolCallId"], "7");
        assert_eq!(results[1]["result"]["status"], "error");
        assert_eq!(results[1]["result"]["success"], false);
    }

    #[tokio::test]
    async fn diagnostics_report_presence_only() {
        let state = state_with(
            Arc::new(SheetsSink::new(None)),
            &[("GOOGLE_SHEETS_API_KEY", "super-secret"), ("SPREADSHEET_ID", "sheet-42")],
        );
        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/test")
            .header("host", "example.test")
            .body(Body::empty())
            .unwrap();
        let response = build_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!text.contains("super-secret"));
        assert!(!text.contains("sheet-42"));

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["environment"]["hasGoogleSheetsKey"], true);
        assert_eq!(value["environment"]["hasServiceAccount"], false);
        assert_eq!(value["environment"]["hasSpreadsheetId"], true);
        assert_eq!(value["environment"]["sheetName"], "Tickets");
        assert_eq!(value["endpoint"], "example.test/api/vapi/events");
    }
}
