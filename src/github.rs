//! GitHub REST access: reading class sources and opening pull requests.

use crate::error::SourceError;
use crate::layout::UnitLayout;
use crate::llm::client::create_http_client;
use crate::pipeline::ReviewPublisher;
use crate::source::SourceReader;
use crate::util::sanitize_error_body;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const API_TIMEOUT_SECS: u64 = 60;
const USER_AGENT: &str = "apex-autoheal";
const API_VERSION: &str = "2022-11-28";

/// Extract owner and repo from an `owner/repo` slug or a GitHub remote URL.
///
/// Supports:
/// - owner/repo
/// - git@github.com:owner/repo.git
/// - https://github.com/owner/repo(.git)
pub fn parse_repo_slug(input: &str) -> Option<(String, String)> {
    let input = input.trim();

    let path = if let Some(rest) = input.strip_prefix("git@github.com:") {
        rest.to_string()
    } else if input.contains("github.com") {
        match url::Url::parse(input) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => input.split("github.com").nth(1)?.to_string(),
        }
    } else if input.contains("://") || input.contains('@') {
        return None;
    } else {
        input.to_string()
    };

    let path = path.trim_start_matches(['/', ':']).trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    let (owner, repo) = path.split_once('/')?;
    let valid = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if valid(owner) && valid(repo) {
        Some((owner.to_string(), repo.to_string()))
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct GitHubSettings {
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    pub token: String,
    /// Target branch for pull requests.
    pub base_branch: String,
    pub layout: UnitLayout,
}

pub struct GitHubClient {
    http: reqwest::Client,
    settings: GitHubSettings,
}

#[derive(Serialize)]
struct CreatePrRequest {
    title: String,
    body: String,
    head: String,
    base: String,
}

#[derive(Deserialize)]
struct CreatePrResponse {
    html_url: String,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

impl GitHubClient {
    pub fn new(settings: GitHubSettings) -> Result<Self> {
        let http = create_http_client(Duration::from_secs(API_TIMEOUT_SECS))?;
        Ok(Self { http, settings })
    }

    fn repo_url(&self, tail: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.owner,
            self.settings.repo,
            tail
        )
    }

    fn contents_url(&self, path: &str, branch_ref: &str) -> Result<url::Url> {
        let base = self.repo_url(&format!("contents/{}", path));
        url::Url::parse_with_params(&base, &[("ref", branch_ref)])
            .with_context(|| format!("Invalid contents URL: {}", base))
    }

    fn request(&self, method: reqwest::Method, url: impl reqwest::IntoUrl) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.settings.token))
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
    }
}

#[async_trait]
impl SourceReader for GitHubClient {
    async fn read(&self, unit: &str, branch_ref: &str) -> Result<String, SourceError> {
        let path = self.settings.layout.path_for(unit);
        let fetch_failed = |reason: String| SourceError::FetchFailed {
            unit: unit.to_string(),
            reason,
        };

        let url = self
            .contents_url(&path, branch_ref)
            .map_err(|e| fetch_failed(e.to_string()))?;
        let resp = self
            .request(reqwest::Method::GET, url)
            .header("Accept", "application/vnd.github.v3.raw")
            .send()
            .await
            .map_err(|e| fetch_failed(format!("request failed: {}", e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| fetch_failed(format!("failed to read response: {}", e)))?;

        match status.as_u16() {
            200 => Ok(body),
            404 => Err(SourceError::UnitNotFound {
                unit: unit.to_string(),
                path,
            }),
            401 => Err(fetch_failed(
                "(Status: 401) - GitHub token may be expired or invalid".to_string(),
            )),
            code => Err(fetch_failed(format!(
                "(Status: {}) {}",
                code,
                sanitize_error_body(&body)
            ))),
        }
    }
}

#[async_trait]
impl ReviewPublisher for GitHubClient {
    async fn open_pull_request(&self, branch: &str, title: &str, body: &str) -> Result<String> {
        let request = CreatePrRequest {
            title: title.to_string(),
            body: body.to_string(),
            head: branch.to_string(),
            base: self.settings.base_branch.clone(),
        };

        let resp = self
            .request(reqwest::Method::POST, self.repo_url("pulls"))
            .header("Accept", "application/vnd.github+json")
            .json(&request)
            .send()
            .await
            .context("Failed to send PR creation request")?;

        let status = resp.status();
        if status.is_success() {
            let pr: CreatePrResponse = resp.json().await.context("Failed to parse PR response")?;
            return Ok(pr.html_url);
        }

        let error_body = resp.text().await.unwrap_or_default();
        if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(&error_body) {
            let detail = api_error
                .errors
                .first()
                .and_then(|e| e.message.clone())
                .unwrap_or_default();
            let msg = if detail.is_empty() {
                api_error.message
            } else {
                format!("{}: {}", api_error.message, detail)
            };
            return Err(anyhow::anyhow!("GitHub API error ({}): {}", status.as_u16(), msg));
        }

        Err(anyhow::anyhow!(
            "GitHub API error ({}): {}",
            status.as_u16(),
            sanitize_error_body(&error_body)
        ))
    }
}
