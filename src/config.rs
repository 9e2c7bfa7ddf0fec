//! Configuration for apex-autoheal
//!
//! Layers, later wins: built-in defaults, a TOML file
//! (`~/.config/apex-autoheal/config.toml` or `--config`), a `.env` file in the
//! working directory, then process environment variables.

use crate::github::{parse_repo_slug, DEFAULT_API_BASE};
use crate::jira::DEFAULT_ISSUE_TYPE;
use crate::layout::UnitLayout;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_BRANCH: &str = "main";
const DEFAULT_MODELS_ENDPOINT: &str = "https://api.salesforce.com";
const DEFAULT_MODEL_ID: &str = "sfdc_ai__DefaultGPT4Omni";
const DEFAULT_AUTHOR_NAME: &str = "Self-Healing Agent";
const DEFAULT_AUTHOR_EMAIL: &str = "selfhealing@example.com";

/// Secret that never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("\"<redacted>\"")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SalesforceConfig {
    pub instance_url: String,
    pub api_endpoint: String,
    pub access_token: Secret,
    pub model_id: String,
}

impl Default for SalesforceConfig {
    fn default() -> Self {
        Self {
            instance_url: String::new(),
            api_endpoint: DEFAULT_MODELS_ENDPOINT.to_string(),
            access_token: Secret::default(),
            model_id: DEFAULT_MODEL_ID.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub token: Secret,
    /// `owner/repo`
    pub repo: String,
    pub branch: String,
    pub api_base: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: Secret::default(),
            repo: String::new(),
            branch: DEFAULT_BRANCH.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub user_name: String,
    pub user_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            user_name: DEFAULT_AUTHOR_NAME.to_string(),
            user_email: DEFAULT_AUTHOR_EMAIL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JiraConfig {
    pub base_url: String,
    pub email: String,
    pub api_token: Secret,
    pub project_key: String,
    pub issue_type: String,
}

impl Default for JiraConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            email: String::new(),
            api_token: Secret::default(),
            project_key: String::new(),
            issue_type: DEFAULT_ISSUE_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub salesforce: SalesforceConfig,
    pub github: GitHubConfig,
    pub git: GitConfig,
    pub jira: JiraConfig,
    pub layout: UnitLayout,
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("apex-autoheal"))
    }

    /// Default config file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load every layer. An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        match dotenv::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
            Err(err) if err.not_found() => {}
            Err(err) => tracing::warn!(error = %err, "ignoring unreadable .env file"),
        }

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML")
    }

    /// Overlay environment variables; unset or blank values leave the field alone.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let set = |field: &mut String, key: &str| {
            if let Some(value) = get(key) {
                *field = value;
            }
        };
        set(&mut self.server.bind, "AUTOHEAL_BIND");
        set(&mut self.salesforce.instance_url, "SF_INSTANCE");
        set(&mut self.salesforce.api_endpoint, "SF_API_ENDPOINT");
        set(&mut self.salesforce.model_id, "MODEL_ID");
        set(&mut self.github.repo, "GIT_REPO");
        set(&mut self.github.branch, "GIT_BRANCH");
        set(&mut self.github.api_base, "GITHUB_API_BASE");
        set(&mut self.git.user_name, "GIT_USER_NAME");
        set(&mut self.git.user_email, "GIT_USER_EMAIL");
        set(&mut self.jira.base_url, "JIRA_BASE_URL");
        set(&mut self.jira.email, "JIRA_EMAIL");
        set(&mut self.jira.project_key, "JIRA_PROJECT_KEY");
        set(&mut self.jira.issue_type, "JIRA_ISSUE_TYPE");
        set(&mut self.layout.source_root, "APEX_SOURCE_ROOT");
        set(&mut self.layout.extension, "APEX_SOURCE_EXTENSION");

        if let Some(token) = get("SF_ACCESS_TOKEN") {
            self.salesforce.access_token = Secret::new(token);
        }
        if let Some(token) = get("GIT_TOKEN").or_else(|| get("GITHUB_TOKEN")) {
            self.github.token = Secret::new(token);
        }
        if let Some(token) = get("JIRA_API_TOKEN") {
            self.jira.api_token = Secret::new(token);
        }
    }

    /// Check everything needed to run, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        let mut require = |value: &str, name: &str| {
            if value.trim().is_empty() {
                missing.push(name.to_string());
            }
        };
        require(&self.salesforce.instance_url, "salesforce.instance_url (SF_INSTANCE)");
        require(&self.salesforce.api_endpoint, "salesforce.api_endpoint (SF_API_ENDPOINT)");
        require(self.salesforce.access_token.expose(), "salesforce.access_token (SF_ACCESS_TOKEN)");
        require(&self.salesforce.model_id, "salesforce.model_id (MODEL_ID)");
        require(self.github.token.expose(), "github.token (GIT_TOKEN)");
        require(&self.github.repo, "github.repo (GIT_REPO)");
        require(&self.github.branch, "github.branch (GIT_BRANCH)");
        require(&self.jira.base_url, "jira.base_url (JIRA_BASE_URL)");
        require(&self.jira.email, "jira.email (JIRA_EMAIL)");
        require(self.jira.api_token.expose(), "jira.api_token (JIRA_API_TOKEN)");
        require(&self.jira.project_key, "jira.project_key (JIRA_PROJECT_KEY)");

        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("missing required settings: {}", missing.join(", ")));
        }
        if !self.github.repo.trim().is_empty() && self.repo_slug().is_none() {
            problems.push(format!(
                "github.repo must look like owner/repo (got {:?})",
                self.github.repo
            ));
        }
        if !crate::git_ops::is_valid_git_ref(&self.github.branch) {
            problems.push(format!("github.branch is not a valid ref: {:?}", self.github.branch));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Invalid configuration: {}", problems.join("; ")))
        }
    }

    pub fn repo_slug(&self) -> Option<(String, String)> {
        parse_repo_slug(&self.github.repo)
    }
}
