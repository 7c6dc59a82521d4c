use std::{
    future::Future,
    pin::Pin,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::models::TicketRecord;

pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const TOKEN_LIFETIME_SECONDS: u64 = 3600;
const TOKEN_REFRESH_MARGIN_SECONDS: u64 = 60;

pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SheetsError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum SheetsError {
    #[error("sheets persistence is not configured: {0}")]
    Config(String),

    #[error("invalid service account credentials: {0}")]
    Credentials(String),

    #[error("failed to sign service account assertion: {0}")]
    Jwt(String),

    #[error("sheets request failed: {0}")]
    Network(String),

    #[error("sheets request timed out after {0:?}")]
    Timeout(Duration),

    #[error("sheets API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("failed to decode sheets response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for SheetsError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Network(format!("timeout: {value}"))
        } else if value.is_decode() {
            Self::Decode(value.to_string())
        } else {
            Self::Network(value.to_string())
        }
    }
}

/// Append-only destination for ticket rows.
pub trait TicketSink: Send + Sync {
    /// Whether enough configuration exists to attempt an append at all.
    fn is_configured(&self) -> bool;

    fn append<'a>(&'a self, record: &'a TicketRecord) -> SinkFuture<'a>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetsAuth {
    ServiceAccount(String),
    ApiKey(String),
}

#[derive(Debug, Clone)]
pub struct SheetsSettings {
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub auth: SheetsAuth,
    pub api_base_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    /// Accepts the base64 blob deployments store in the environment, or the
    /// raw JSON key file contents.
    pub fn parse(encoded: &str) -> Result<Self, SheetsError> {
        let trimmed = encoded.trim();
        let raw = if trimmed.starts_with('{') {
            trimmed.as_bytes().to_vec()
        } else {
            STANDARD
                .decode(trimmed)
                .map_err(|err| SheetsError::Credentials(format!("base64 decode failed: {err}")))?
        };

        let key: Self = serde_json::from_slice(&raw)
            .map_err(|err| SheetsError::Credentials(format!("key JSON is malformed: {err}")))?;
        if key.client_email.trim().is_empty() || key.private_key.trim().is_empty() {
            return Err(SheetsError::Credentials(
                "client_email and private_key are required".to_string(),
            ));
        }
        Ok(key)
    }

    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    expires_at: u64,
}

enum Credentials {
    ServiceAccount {
        client_email: String,
        token_uri: String,
        signing_key: EncodingKey,
        token: Mutex<Option<CachedToken>>,
    },
    ApiKey(String),
}

/// Authenticated Sheets API handle.
pub struct SheetsClient {
    http: reqwest::Client,
    settings: SheetsSettings,
    credentials: Credentials,
}

impl SheetsClient {
    pub fn connect(settings: SheetsSettings) -> Result<Self, SheetsError> {
        let credentials = match &settings.auth {
            SheetsAuth::ServiceAccount(blob) => {
                let key = ServiceAccountKey::parse(blob)?;
                let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
                    .map_err(|err| SheetsError::Credentials(err.to_string()))?;
                Credentials::ServiceAccount {
                    client_email: key.client_email.clone(),
                    token_uri: key.token_uri().to_string(),
                    signing_key,
                    token: Mutex::new(None),
                }
            }
            SheetsAuth::ApiKey(key) => Credentials::ApiKey(key.clone()),
        };

        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent("vapi-ticket-webhook/0.1")
            .build()
            .map_err(|err| SheetsError::Config(format!("failed to build HTTP client: {err}")))?;

        info!(
            spreadsheet_id = %settings.spreadsheet_id,
            sheet = %settings.sheet_name,
            auth = settings.auth.kind(),
            "Sheets client initialised"
        );

        Ok(Self {
            http,
            settings,
            credentials,
        })
    }

    pub async fn append_row(&self, row: &[String]) -> Result<(), SheetsError> {
        let url = append_url(&self.settings)?;
        let mut request = self
            .http
            .post(url)
            .query(&[
                ("valueInputOption", "USER_ENTERED"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&append_body(row));

        match &self.credentials {
            Credentials::ApiKey(key) => {
                request = request.query(&[("key", key.as_str())]);
            }
            Credentials::ServiceAccount { .. } => {
                let token = self.access_token().await?;
                request = request.bearer_auth(token);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SheetsError::Api {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        debug!(status = status.as_u16(), "Sheets append accepted");
        Ok(())
    }

    async fn access_token(&self) -> Result<String, SheetsError> {
        let Credentials::ServiceAccount {
            client_email,
            token_uri,
            signing_key,
            token,
        } = &self.credentials
        else {
            return Err(SheetsError::Config(
                "access tokens require a service account".to_string(),
            ));
        };

        let now = unix_now()?;
        let mut cached = token.lock().await;
        if let Some(existing) = cached.as_ref() {
            if existing.expires_at > now + TOKEN_REFRESH_MARGIN_SECONDS {
                return Ok(existing.access_token.clone());
            }
        }

        let assertion = sign_assertion(client_email, token_uri, signing_key, now)?;

        #[derive(Debug, Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default)]
            expires_in: Option<u64>,
        }

        let response = self
            .http
            .post(token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SheetsError::Api {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|err| SheetsError::Decode(err.to_string()))?;
        let expires_at = now + parsed.expires_in.unwrap_or(TOKEN_LIFETIME_SECONDS);
        let access_token = parsed.access_token;
        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at,
        });
        debug!(expires_at, "Service account access token refreshed");
        Ok(access_token)
    }
}

impl SheetsAuth {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServiceAccount(_) => "service_account",
            Self::ApiKey(_) => "api_key",
        }
    }
}

/// Sheets-backed [`TicketSink`]. Without settings every append is skipped by
/// the dispatcher; with settings the client is built lazily and exactly once.
pub struct SheetsSink {
    settings: Option<SheetsSettings>,
    client: OnceCell<SheetsClient>,
}

impl SheetsSink {
    pub fn new(settings: Option<SheetsSettings>) -> Self {
        Self {
            settings,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&SheetsClient, SheetsError> {
        let Some(settings) = self.settings.as_ref() else {
            return Err(SheetsError::Config(
                "spreadsheet id or credentials missing".to_string(),
            ));
        };
        self.client
            .get_or_try_init(|| async { SheetsClient::connect(settings.clone()) })
            .await
    }
}

impl TicketSink for SheetsSink {
    fn is_configured(&self) -> bool {
        self.settings.is_some()
    }

    fn append<'a>(&'a self, record: &'a TicketRecord) -> SinkFuture<'a> {
        Box::pin(async move {
            let client = self.client().await?;
            client.append_row(&record.to_row()).await
        })
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

fn sign_assertion(
    client_email: &str,
    token_uri: &str,
    key: &EncodingKey,
    now: u64,
) -> Result<String, SheetsError> {
    let claims = AssertionClaims {
        iss: client_email,
        scope: SHEETS_SCOPE,
        aud: token_uri,
        iat: now,
        exp: now + TOKEN_LIFETIME_SECONDS,
    };
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, key)
        .map_err(|err| SheetsError::Jwt(err.to_string()))
}

pub fn append_url(settings: &SheetsSettings) -> Result<Url, SheetsError> {
    let mut url = Url::parse(&settings.api_base_url).map_err(|err| {
        SheetsError::Config(format!("invalid sheets base URL {}: {err}", settings.api_base_url))
    })?;
    let range = format!("{}!A:K:append", settings.sheet_name);
    url.path_segments_mut()
        .map_err(|_| {
            SheetsError::Config(format!("sheets base URL cannot take a path: {}", settings.api_base_url))
        })?
        .pop_if_empty()
        .extend(["v4", "spreadsheets", settings.spreadsheet_id.as_str(), "values", range.as_str()]);
    Ok(url)
}

pub fn append_body(row: &[String]) -> serde_json::Value {
    json!({ "values": [row] })
}

fn unix_now() -> Result<u64, SheetsError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|err| SheetsError::Jwt(format!("system clock before epoch: {err}")))
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
