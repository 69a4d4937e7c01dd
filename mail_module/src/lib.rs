//! Outbound mail transport over the Gmail REST API.
//!
//! Send-only plus thread inspection: `send` assembles and dispatches a
//! message, `list_unread_in_thread` supports reply-detection polling.
//! Credentials come from the standard Google OAuth refresh-token flow, with a
//! pre-issued access token as an escape hatch for sandboxed environments.

use std::env;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Refresh slightly before Google says the token expires.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport error: status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("auth error: {0}")]
    Auth(String),
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_base: String,
    pub token_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub timeout: Duration,
}

impl MailConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            api_base: env_var_non_empty("GMAIL_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            token_url: env_var_non_empty("GMAIL_TOKEN_URL")
                .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            client_id: env_var_non_empty("GOOGLE_CLIENT_ID"),
            client_secret: env_var_non_empty("GOOGLE_CLIENT_SECRET"),
            refresh_token: env_var_non_empty("GOOGLE_REFRESH_TOKEN"),
            access_token: env_var_non_empty("GOOGLE_ACCESS_TOKEN"),
            timeout: env::var("MAIL_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        }
    }

    /// A pre-issued access token is valid on its own; otherwise the full
    /// refresh-token triple is required.
    pub fn is_valid(&self) -> bool {
        self.access_token.is_some()
            || (self.client_id.is_some()
                && self.client_secret.is_some()
                && self.refresh_token.is_some())
    }
}

/// Result of a successful send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: String,
    pub thread_id: Option<String>,
}

/// One unread message observed in a thread.
#[derive(Debug, Clone)]
pub struct ThreadMessage {
    pub message_id: String,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub internal_date: Option<DateTime<Utc>>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct MailClient {
    config: MailConfig,
    http: reqwest::blocking::Client,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
}

#[derive(Deserialize)]
struct ThreadResponse {
    #[serde(default)]
    messages: Vec<RawThreadMessage>,
}

#[derive(Deserialize)]
struct RawThreadMessage {
    id: String,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    #[serde(default, rename = "labelIds")]
    label_ids: Vec<String>,
    payload: Option<RawPayload>,
}

#[derive(Deserialize)]
struct RawPayload {
    #[serde(default)]
    headers: Vec<RawHeader>,
}

#[derive(Deserialize)]
struct RawHeader {
    name: String,
    value: String,
}

impl RawThreadMessage {
    fn header_value(&self, name: &str) -> Option<&str> {
        self.payload.as_ref().and_then(|payload| {
            payload
                .headers
                .iter()
                .find(|header| header.name.eq_ignore_ascii_case(name))
                .map(|header| header.value.as_str())
        })
    }
}

impl MailClient {
    pub fn new(config: MailConfig) -> Result<Self, MailError> {
        if !config.is_valid() {
            return Err(MailError::MissingConfig(
                "GOOGLE_ACCESS_TOKEN or GOOGLE_CLIENT_ID/GOOGLE_CLIENT_SECRET/GOOGLE_REFRESH_TOKEN",
            ));
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    pub fn from_env() -> Result<Self, MailError> {
        Self::new(MailConfig::from_env())
    }

    /// Send a message; the transport assigns the message and thread ids.
    pub fn send(&self, to: &str, subject: &str, body: &str) -> Result<SendOutcome, MailError> {
        let token = self.access_token()?;
        let mime = format!(
            "Content-Type: text/html; charset=utf-8\r\n\
             MIME-Version: 1.0\r\n\
             To: {to}\r\n\
             Subject: {subject}\r\n\
             \r\n\
             {body}"
        );
        let raw = URL_SAFE_NO_PAD.encode(mime.as_bytes());

        let url = format!("{}/users/me/messages/send", self.config.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&serde_json::json!({ "raw": raw }))
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(MailError::Api {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }

        let parsed: SendResponse = response.json()?;
        Ok(SendOutcome {
            message_id: parsed.id,
            thread_id: parsed.thread_id,
        })
    }

    /// List the unread messages of a thread, oldest first as Gmail returns
    /// them. Used to poll for replies.
    pub fn list_unread_in_thread(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, MailError> {
        let token = self.access_token()?;
        let url = format!(
            "{}/users/me/threads/{}?format=metadata&metadataHeaders=From&metadataHeaders=Subject",
            self.config.api_base, thread_id
        );
        let response = self.http.get(&url).bearer_auth(&token).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(MailError::Api {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }

        let parsed: ThreadResponse = response.json()?;
        let messages = parsed
            .messages
            .into_iter()
            .filter(|message| message.label_ids.iter().any(|label| label == "UNREAD"))
            .map(|message| ThreadMessage {
                from: message.header_value("From").map(str::to_string),
                subject: message.header_value("Subject").map(str::to_string),
                internal_date: message
                    .internal_date
                    .as_deref()
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
                message_id: message.id,
            })
            .collect();
        Ok(messages)
    }

    fn access_token(&self) -> Result<String, MailError> {
        if let Some(token) = &self.config.access_token {
            return Ok(token.clone());
        }

        {
            let cached = self
                .token
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() {
                    return Ok(token.value.clone());
                }
            }
        }

        let client_id = self
            .config
            .client_id
            .as_deref()
            .ok_or(MailError::MissingConfig("GOOGLE_CLIENT_ID"))?;
        let client_secret = self
            .config
            .client_secret
            .as_deref()
            .ok_or(MailError::MissingConfig("GOOGLE_CLIENT_SECRET"))?;
        let refresh_token = self
            .config
            .refresh_token
            .as_deref()
            .ok_or(MailError::MissingConfig("GOOGLE_REFRESH_TOKEN"))?;

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(MailError::Auth(format!(
                "token refresh failed: status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .map_err(|err| MailError::Auth(format!("token response: {err}")))?;
        let lifetime = parsed
            .expires_in
            .unwrap_or(3600)
            .saturating_sub(TOKEN_EXPIRY_MARGIN_SECS);
        let token = parsed.access_token;

        let mut cached = self
            .token
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        *cached = Some(CachedToken {
            value: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(token)
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
