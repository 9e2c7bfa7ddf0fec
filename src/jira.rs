//! Jira Cloud issue creation for tracking published fixes.

use crate::llm::client::create_http_client;
use crate::pipeline::TicketTracker;
use crate::util::sanitize_error_body;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const API_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ISSUE_TYPE: &str = "Task";

#[derive(Debug, Clone)]
pub struct JiraSettings {
    pub base_url: String,
    pub email: String,
    pub api_token: String,
    pub project_key: String,
    pub issue_type: String,
}

pub struct JiraClient {
    http: reqwest::Client,
    settings: JiraSettings,
}

#[derive(Deserialize)]
struct CreatedIssue {
    key: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct JiraErrorResponse {
    #[serde(default)]
    error_messages: Vec<String>,
    #[serde(default)]
    errors: serde_json::Map<String, Value>,
}

impl JiraErrorResponse {
    fn summary(&self) -> Option<String> {
        let mut parts: Vec<String> = self.error_messages.clone();
        for (field, message) in &self.errors {
            match message.as_str() {
                Some(text) => parts.push(format!("{}: {}", field, text)),
                None => parts.push(format!("{}: {}", field, message)),
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

impl JiraClient {
    pub fn new(settings: JiraSettings) -> Result<Self> {
        let http = create_http_client(Duration::from_secs(API_TIMEOUT_SECS))?;
        Ok(Self { http, settings })
    }

    fn base_url(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }
}

/// Plain text as an Atlassian Document, one paragraph per non-empty line.
fn adf_document(text: &str) -> Value {
    let paragraphs: Vec<Value> = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(|line| {
            json!({
                "type": "paragraph",
                "content": [{"type": "text", "text": line}]
            })
        })
        .collect();
    json!({"type": "doc", "version": 1, "content": paragraphs})
}

#[async_trait]
impl TicketTracker for JiraClient {
    async fn create_ticket(&self, summary: &str, description: &str) -> Result<String> {
        let payload = json!({
            "fields": {
                "project": {"key": self.settings.project_key},
                "summary": summary,
                "description": adf_document(description),
                "issuetype": {"name": self.settings.issue_type},
            }
        });

        let resp = self
            .http
            .post(format!("{}/rest/api/3/issue", self.base_url()))
            .basic_auth(&self.settings.email, Some(&self.settings.api_token))
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await
            .context("Failed to send Jira issue request")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let detail = serde_json::from_str::<JiraErrorResponse>(&body)
                .ok()
                .and_then(|e| e.summary())
                .unwrap_or_else(|| sanitize_error_body(&body));
            return Err(anyhow::anyhow!("Jira API error ({}): {}", status.as_u16(), detail));
        }

        let issue: CreatedIssue = serde_json::from_str(&body).with_context(|| {
            format!("Failed to parse Jira response: {}", sanitize_error_body(&body))
        })?;
        Ok(format!("{}/browse/{}", self.base_url(), issue.key))
    }
}
