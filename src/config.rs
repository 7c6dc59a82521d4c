use std::{env, net::SocketAddr, time::Duration};

use anyhow::Result;
use tracing::warn;

use crate::sheets::{SheetsAuth, SheetsSettings};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SHEET_NAME: &str = "Tickets";
pub const DEFAULT_SHEETS_API_BASE_URL: &str = "https://sheets.googleapis.com";
pub const DEFAULT_SHEETS_TIMEOUT_SECONDS: u64 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub spreadsheet_id: Option<String>,
    pub sheet_name: String,
    pub sheets_api_key: Option<String>,
    pub service_account_key: Option<String>,
    pub sheets_api_base_url: String,
    pub sheets_timeout: Duration,
    pub dev_log_payloads: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_lookup(|key| env::var(key).ok()))
    }

    /// Builds the config from any key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).map(normalize).filter(|v| !v.is_empty());

        let port = value("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let bind_addr = value("VAPI_WEBHOOK_BIND_ADDR")
            .and_then(|v| match v.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!("Ignoring unparsable VAPI_WEBHOOK_BIND_ADDR `{v}`");
                    None
                }
            })
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], port)));

        let sheets_timeout = value("SHEETS_REQUEST_TIMEOUT_SECONDS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_SHEETS_TIMEOUT_SECONDS));

        let dev_log_payloads = value("VAPI_DEV_LOG_PAYLOADS")
            .map(|v| {
                matches!(
                    v.to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(false);

        Self {
            bind_addr,
            spreadsheet_id: value("SPREADSHEET_ID"),
            sheet_name: value("SHEET_NAME").unwrap_or_else(|| DEFAULT_SHEET_NAME.to_string()),
            sheets_api_key: value("GOOGLE_SHEETS_API_KEY"),
            service_account_key: value("GOOGLE_SERVICE_ACCOUNT_KEY"),
            sheets_api_base_url: value("GOOGLE_SHEETS_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_SHEETS_API_BASE_URL.to_string()),
            sheets_timeout,
            dev_log_payloads,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.sheets_api_key.is_some() || self.service_account_key.is_some()
    }

    /// Settings for the ticket sheet, or `None` when persistence must be
    /// skipped. A service account is preferred over an API key.
    pub fn sheets_settings(&self) -> Option<SheetsSettings> {
        let spreadsheet_id = self.spreadsheet_id.clone()?;
        let auth = match (&self.service_account_key, &self.sheets_api_key) {
            (Some(blob), _) => SheetsAuth::ServiceAccount(blob.clone()),
            (None, Some(key)) => SheetsAuth::ApiKey(key.clone()),
            (None, None) => return None,
        };

        Some(SheetsSettings {
            spreadsheet_id,
            sheet_name: self.sheet_name.clone(),
            auth,
            api_base_url: self.sheets_api_base_url.clone(),
            request_timeout: self.sheets_timeout,
        })
    }
}

fn normalize(raw: String) -> String {
    raw.trim().trim_matches('"').trim_matches('\'').trim().to_string()
}
