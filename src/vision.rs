use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

// ========================= Perception Contract =========================

#[derive(Clone, Debug)]
pub struct PerceptionRequest {
    pub task_text: String,
    /// PNG bytes.
    pub image: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Analysis {
    pub analysis_text: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PerceptionError {
    #[error("perception timed out")]
    Timeout,
    #[error("perception transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Perception: Send + Sync {
    async fn analyze(&self, req: PerceptionRequest) -> Result<Analysis, PerceptionError>;
}

// ========================= OpenAI-compatible Client =========================

#[derive(Clone)]
pub struct VisionConfig {
    pub api_base: String,        // e.g. "http://127.0.0.1:1234"
    pub api_key: Option<String>, // only hosted endpoints need one
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("LOCAL_LLM_URL").unwrap_or_else(|_| "http://127.0.0.1:1234".into()),
            api_key: env::var("VISION_API_KEY")
                .or_else(|_| env::var("OPENAI_API_KEY"))
                .ok()
                .filter(|k| !k.trim().is_empty()),
            model: env::var("LOCAL_LLM_MODEL")
                .unwrap_or_else(|_| "deepseek/deepseek-r1-0528-qwen3-8b".into()),
            max_tokens: 1000,
            temperature: 0.7,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone)]
pub struct VisionClient {
    http: Client,
    cfg: VisionConfig,
}

impl VisionClient {
    pub fn new(cfg: VisionConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, cfg })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.cfg.api_base.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.cfg.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Lists model ids; doubles as a connectivity probe.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let resp = self
            .authorize(self.http.get(self.url("models")))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("model listing failed {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse models JSON")?;
        let ids = v
            .get("data")
            .and_then(|x| x.as_array())
            .context("unexpected models response")?
            .iter()
            .filter_map(|m| m.get("id").and_then(|x| x.as_str()).map(str::to_string))
            .collect();
        Ok(ids)
    }

    pub async fn describe(&self, task: &str, png: &[u8]) -> Result<String> {
        let body = Self::build_request(&self.cfg, task, png);
        let resp = self
            .authorize(self.http.post(self.url("chat/completions")))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("vision model error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse completion JSON")?;
        Self::parse_analysis(&v)
    }

    fn build_request(cfg: &VisionConfig, task: &str, png: &[u8]) -> Value {
        let system = format!(
            "You are a computer vision expert analyzing browser screenshots.\n\n\
             Current task: {task}\n\n\
             Analyze the screenshot and provide:\n\
             1. What elements are visible on the page\n\
             2. What actions can be performed\n\
             3. Specific instructions for the next step\n\n\
             Be concise and actionable."
        );
        json!({
          "model": cfg.model,
          "messages": [
            { "role": "system", "content": system },
            { "role": "user", "content": [
                { "type": "text", "text": format!("Analyze this screenshot for the task: {task}") },
                { "type": "image_url", "image_url": {
                    "url": format!("data:image/png;base64,{}", STANDARD.encode(png))
                }}
            ]}
          ],
          "max_tokens": cfg.max_tokens,
          "temperature": cfg.temperature,
          "stream": false
        })
    }

    fn parse_analysis(v: &Value) -> Result<String> {
        let content = v
            .pointer("/choices/0/message/content")
            .context("unexpected completion response")?;
        // Some servers return content parts instead of a plain string.
        let text = match content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => bail!("unexpected completion content"),
        };
        if text.trim().is_empty() {
            bail!("empty analysis");
        }
        Ok(text)
    }
}

#[async_trait]
impl Perception for VisionClient {
    async fn analyze(&self, req: PerceptionRequest) -> Result<Analysis, PerceptionError> {
        debug!(model = %self.cfg.model, bytes = req.image.len(), "requesting analysis");
        let text = self.describe(&req.task_text, &req.image).await.map_err(|e| {
            if e.downcast_ref::<reqwest::Error>().is_some_and(|re| re.is_timeout()) {
                PerceptionError::Timeout
            } else {
                PerceptionError::Transport(e.to_string())
            }
        })?;
        info!(chars = text.len(), "analysis received");
        Ok(Analysis { analysis_text: text })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> VisionConfig {
        VisionConfig {
            api_base: "http://127.0.0.1:1234/".into(),
            api_key: None,
            model: "vision-test".into(),
            max_tokens: 1000,
            temperature: 0.7,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn request_carries_task_and_inline_png() {
        let v = VisionClient::build_request(&cfg(), "click the login button", b"png");
        assert_eq!(v["model"], "vision-test");
        assert!(v["messages"][0]["content"].as_str().unwrap().contains("click the login button"));
        let url = v["messages"][1]["content"][1]["image_url"]["url"].as_str().unwrap();
        assert_eq!(url, format!("data:image/png;base64,{}", STANDARD.encode(b"png")));
        assert_eq!(v["stream"], false);
    }

    #[test]
    fn endpoint_urls_tolerate_trailing_slash() {
        let client = VisionClient::new(cfg()).unwrap();
        assert_eq!(client.url("chat/completions"), "http://127.0.0.1:1234/v1/chat/completions");
    }

    #[test]
    fn parses_string_and_part_content() {
        let plain = json!({ "choices": [{ "message": { "content": "A login form." } }] });
        assert_eq!(VisionClient::parse_analysis(&plain).unwrap(), "A login form.");

        let parts = json!({ "choices": [{ "message": { "content": [
            { "type": "text", "text": "Buttons:" }, { "type": "text", "text": "Sign in" }
        ] } }] });
        assert_eq!(VisionClient::parse_analysis(&parts).unwrap(), "Buttons:\nSign in");
    }

    #[test]
    fn rejects_malformed_or_empty_responses() {
        assert!(VisionClient::parse_analysis(&json!({ "choices": [] })).is_err());
        let blank = json!({ "choices": [{ "message": { "content": "  " } }] });
        assert!(VisionClient::parse_analysis(&blank).is_err());
    }
}
