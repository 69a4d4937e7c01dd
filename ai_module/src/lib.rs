//! Content generation for the follow-up pipeline.
//!
//! Wraps an OpenAI-compatible chat-completions API behind three narrow
//! capabilities: drafting a follow-up for an unanswered email, analyzing an
//! incoming reply into a structured verdict, and drafting a chain reply when
//! the analysis asks for one. Retry policy belongs to the caller; every
//! request here is a single attempt with a hard timeout.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_DRAFT_MODEL: &str = "gpt-4";
const DEFAULT_ANALYSIS_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const DRAFT_TEMPERATURE: f32 = 0.7;
const ANALYSIS_TEMPERATURE: f32 = 0.3;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("malformed analysis response: {0}")]
    MalformedResponse(String),
}

/// The original outbound message a draft or analysis is anchored to.
#[derive(Debug, Clone)]
pub struct OriginalEmail {
    pub subject: String,
    pub body: String,
    pub recipient: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

/// Structured verdict over an incoming reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyAnalysis {
    pub sentiment: Sentiment,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    pub needs_response: bool,
    #[serde(default, alias = "responsePriority")]
    pub priority: Priority,
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub api_key: String,
    pub api_base: String,
    pub draft_model: String,
    pub analysis_model: String,
    pub timeout: Duration,
}

impl GenerationConfig {
    pub fn from_env() -> Result<Self, GenerationError> {
        dotenvy::dotenv().ok();

        let api_key = env_var_non_empty("OPENAI_API_KEY")
            .ok_or(GenerationError::MissingConfig("OPENAI_API_KEY"))?;
        let api_base = env_var_non_empty("OPENAI_API_BASE")
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let draft_model = env_var_non_empty("GENERATION_DRAFT_MODEL")
            .unwrap_or_else(|| DEFAULT_DRAFT_MODEL.to_string());
        let analysis_model = env_var_non_empty("GENERATION_ANALYSIS_MODEL")
            .unwrap_or_else(|| DEFAULT_ANALYSIS_MODEL.to_string());
        let timeout = env::var("GENERATION_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        Ok(Self {
            api_key,
            api_base,
            draft_model,
            analysis_model,
            timeout,
        })
    }
}

pub struct GenerationClient {
    config: GenerationConfig,
    http: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl GenerationClient {
    pub fn new(config: GenerationConfig) -> Result<Self, GenerationError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> Result<Self, GenerationError> {
        Self::new(GenerationConfig::from_env()?)
    }

    /// Draft a follow-up for an email that has gone unanswered.
    pub fn draft_follow_up(&self, original: &OriginalEmail) -> Result<String, GenerationError> {
        let prompt = format!(
            "Generate a professional follow-up email based on this original email:\n\n\
             To: {recipient}\n\
             Subject: {subject}\n\
             Content: {body}\n\n\
             The follow-up should:\n\
             1. Be professional and courteous\n\
             2. Reference the original email\n\
             3. Ask for a response or next steps\n\
             4. Be concise and clear\n\
             5. Maintain the same tone as the original email",
            recipient = original.recipient,
            subject = original.subject,
            body = original.body,
        );

        let content = self.complete(
            &self.config.draft_model,
            DRAFT_TEMPERATURE,
            vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            false,
        )?;
        if content.trim().is_empty() {
            return Err(GenerationError::GenerationFailed(
                "empty follow-up draft".to_string(),
            ));
        }
        Ok(content.trim().to_string())
    }

    /// Analyze an incoming reply against the email it answers.
    pub fn analyze_reply(
        &self,
        original: &OriginalEmail,
        reply: &str,
    ) -> Result<ReplyAnalysis, GenerationError> {
        let prompt = format!(
            "Analyze this email reply and determine:\n\
             1. Is this a positive response, negative response, or neutral?\n\
             2. What are the key points or questions in the reply?\n\
             3. What action items or next steps are mentioned?\n\
             4. Is a further response needed?\n\n\
             Original Email:\n\
             Subject: {subject}\n\
             Content: {body}\n\n\
             Reply:\n\
             {reply}\n\n\
             Provide your analysis in JSON format with these fields:\n\
             {{\n\
               \"sentiment\": \"positive|negative|neutral\",\n\
               \"keyPoints\": [\"point1\", \"point2\"],\n\
               \"actionItems\": [\"item1\", \"item2\"],\n\
               \"needsResponse\": true|false,\n\
               \"priority\": \"high|medium|low\"\n\
             }}",
            subject = original.subject,
            body = original.body,
            reply = reply,
        );

        let content = self.complete(
            &self.config.analysis_model,
            ANALYSIS_TEMPERATURE,
            vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            true,
        )?;
        let json = strip_code_fence(&content);
        serde_json::from_str(json)
            .map_err(|err| GenerationError::MalformedResponse(err.to_string()))
    }

    /// Draft a reply continuing the conversation after an analyzed response.
    pub fn draft_chain_reply(
        &self,
        original: &OriginalEmail,
        reply: &str,
        analysis: &ReplyAnalysis,
    ) -> Result<String, GenerationError> {
        let system = "You are an email writing expert. Generate a follow-up email based on the \
                      original email, the reply received, and the analysis provided. The follow-up \
                      should be professional and courteous, address any unanswered questions, \
                      provide any missing information, and maintain a natural conversation flow."
            .to_string();
        let user = format!(
            "Original Email:\nSubject: {subject}\n{body}\n\n\
             Reply Received:\n{reply}\n\n\
             Analysis:\n{context}",
            subject = original.subject,
            body = original.body,
            reply = reply,
            context = render_analysis(analysis),
        );

        let content = self.complete(
            &self.config.draft_model,
            DRAFT_TEMPERATURE,
            vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            false,
        )?;
        if content.trim().is_empty() {
            return Err(GenerationError::GenerationFailed(
                "empty chain reply draft".to_string(),
            ));
        }
        Ok(content.trim().to_string())
    }

    fn complete(
        &self,
        model: &str,
        temperature: f32,
        messages: Vec<ChatMessage<'_>>,
        json_mode: bool,
    ) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.config.api_base);
        let request = ChatRequest {
            model,
            messages,
            temperature,
            response_format: json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GenerationError::GenerationFailed(format!(
                "status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: ChatResponse = response.json()?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| GenerationError::GenerationFailed("no content in response".to_string()))
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Models occasionally wrap JSON-mode output in a fenced code block.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

fn render_analysis(analysis: &ReplyAnalysis) -> String {
    let mut lines = Vec::new();
    lines.push(format!("Sentiment: {:?}", analysis.sentiment));
    lines.push(format!("Needs response: {}", analysis.needs_response));
    lines.push(format!("Priority: {:?}", analysis.priority));
    if !analysis.key_points.is_empty() {
        lines.push(format!("Key points: {}", analysis.key_points.join("; ")));
    }
    if !analysis.action_items.is_empty() {
        lines.push(format!(
            "Action items: {}",
            analysis.action_items.join("; ")
        ));
    }
    lines.join("\n")
}
