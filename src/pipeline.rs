//! End-to-end remediation of one exception report.
//!
//! diagnose -> fetch primary -> negotiate -> publish -> record outcome.
//! Every run ends with exactly one status write on the originating record.

use crate::analyzer::StackTraceAnalyzer;
use crate::error::RemediationError;
use crate::git_ops::{generate_fix_branch_name, WorkspaceProvider};
use crate::layout::UnitLayout;
use crate::llm::Generator;
use crate::negotiator::{ExceptionContext, FixNegotiator, FixSet};
use crate::source::{SourceReader, SourceResolver};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;

/// Length of the random suffix appended to fix branch names.
const BRANCH_SUFFIX_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionReport {
    #[serde(rename = "exception_id")]
    pub id: String,
    #[serde(rename = "exception_message")]
    pub message: String,
    pub stack_trace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemediationStatus {
    #[serde(rename = "Resolved")]
    Resolved,
    #[serde(rename = "Human Intervention")]
    HumanIntervention,
}

impl RemediationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RemediationStatus::Resolved => "Resolved",
            RemediationStatus::HumanIntervention => "Human Intervention",
        }
    }
}

impl fmt::Display for RemediationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What gets written back to the originating record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationOutcome {
    pub status: RemediationStatus,
    pub pr_url: Option<String>,
}

impl RemediationOutcome {
    pub fn resolved(pr_url: &str) -> Self {
        Self {
            status: RemediationStatus::Resolved,
            pr_url: Some(pr_url.to_string()),
        }
    }

    pub fn human_intervention() -> Self {
        Self {
            status: RemediationStatus::HumanIntervention,
            pr_url: None,
        }
    }
}

/// Opens a review request for a pushed branch.
#[async_trait]
pub trait ReviewPublisher: Send + Sync {
    /// Returns the URL of the created pull request.
    async fn open_pull_request(&self, branch: &str, title: &str, body: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait TicketTracker: Send + Sync {
    /// Returns the browse URL of the created ticket.
    async fn create_ticket(&self, summary: &str, description: &str) -> anyhow::Result<String>;
}

/// Writes the run outcome onto the originating exception record.
#[async_trait]
pub trait StatusRecorder: Send + Sync {
    /// Reject ids the recorder could never write to. Checked before any work
    /// is published.
    fn validate_id(&self, _exception_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record(&self, exception_id: &str, outcome: &RemediationOutcome) -> anyhow::Result<()>;
}

/// The external systems a pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn Generator>,
    pub sources: Arc<dyn SourceReader>,
    pub workspace: Arc<dyn WorkspaceProvider>,
    pub reviews: Arc<dyn ReviewPublisher>,
    pub tickets: Arc<dyn TicketTracker>,
    pub status: Arc<dyn StatusRecorder>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Branch source units are read from and fix branches start at.
    pub base_branch: String,
    pub layout: UnitLayout,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            layout: UnitLayout::default(),
        }
    }
}

/// One commit of the publication plan.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlannedCommit {
    unit: String,
    content: String,
    message: String,
}

/// Mutable state owned by exactly one run.
struct RunContext<'r> {
    report: &'r ExceptionReport,
    resolver: SourceResolver,
}

/// Stateless across runs; safe to share behind an `Arc` and run concurrently.
pub struct RemediationPipeline {
    collaborators: Collaborators,
    settings: PipelineSettings,
}

impl RemediationPipeline {
    pub fn new(collaborators: Collaborators, settings: PipelineSettings) -> Self {
        Self {
            collaborators,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Fails when the report's id cannot receive a status update.
    pub fn check_report(&self, report: &ExceptionReport) -> Result<(), RemediationError> {
        self.collaborators
            .status
            .validate_id(&report.id)
            .map_err(|source| RemediationError::InvalidExceptionId {
                exception_id: report.id.clone(),
                source,
            })
    }

    /// Run the whole sequence for one report and return the pull request URL.
    ///
    /// Once the report's id has been accepted, the outcome is recorded exactly
    /// once before returning. An id the recorder rejects fails up front with no
    /// work done and nothing recorded. When the run itself failed, that failure
    /// is returned even if the status write also fails.
    pub async fn remediate(&self, report: &ExceptionReport) -> Result<String, RemediationError> {
        let span = tracing::info_span!("remediate", exception_id = %report.id);
        async move {
            if let Err(err) = self.check_report(report) {
                tracing::error!(kind = err.kind(), error = %err, "rejecting report");
                return Err(err);
            }

            tracing::info!("starting remediation");
            let result = self.run(report).await;

            let outcome = match &result {
                Ok(pr_url) => RemediationOutcome::resolved(pr_url),
                Err(err) => {
                    tracing::error!(kind = err.kind(), error = %err, "remediation failed, flagging for human intervention");
                    RemediationOutcome::human_intervention()
                }
            };

            let recorded = self
                .collaborators
                .status
                .record(&report.id, &outcome)
                .await
                .map_err(|source| RemediationError::StatusUpdateFailed {
                    exception_id: report.id.clone(),
                    source,
                });

            match (result, recorded) {
                (Ok(pr_url), Ok(())) => {
                    tracing::info!(%pr_url, status = %outcome.status, "remediation complete");
                    Ok(pr_url)
                }
                (Ok(_), Err(status_err)) => {
                    tracing::error!(error = %status_err, "fix published but status update failed");
                    Err(status_err)
                }
                (Err(run_err), Ok(())) => Err(run_err),
                (Err(run_err), Err(status_err)) => {
                    tracing::error!(error = %status_err, "status update failed after failed run");
                    Err(run_err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(&self, report: &ExceptionReport) -> Result<String, RemediationError> {
        let mut ctx = RunContext {
            report,
            resolver: SourceResolver::new(
                Arc::clone(&self.collaborators.sources),
                self.settings.layout.clone(),
                &self.settings.base_branch,
            ),
        };
        let generator = self.collaborators.generator.as_ref();

        let diagnosis = StackTraceAnalyzer::new(generator)
            .analyze(&ctx.report.message, &ctx.report.stack_trace)
            .await?;
        let frame = diagnosis
            .primary_frame()
            .ok_or_else(|| RemediationError::UnparsableTrace {
                attempts: 0,
                reason: "diagnosis contained no frames".to_string(),
            })?;

        let primary_unit = ctx.resolver.canonical_name(&frame.class)?;
        let primary_source = ctx.resolver.fetch(&primary_unit).await?;

        let exception = ExceptionContext {
            message: &ctx.report.message,
            stack_trace: &ctx.report.stack_trace,
            error_line: frame.line,
        };
        let fix_set = FixNegotiator::new(generator, &mut ctx.resolver)
            .negotiate(&primary_unit, &primary_source, &exception)
            .await?;

        self.publish(ctx.report, &fix_set)
            .await
            .map_err(RemediationError::FinalizationFailed)
    }

    async fn publish(&self, report: &ExceptionReport, fix_set: &FixSet) -> anyhow::Result<String> {
        let primary = fix_set.primary();
        let branch = generate_fix_branch_name(primary, &branch_suffix());
        let commits: Vec<PlannedCommit> = fix_set
            .iter()
            .map(|(unit, content)| PlannedCommit {
                unit: unit.to_string(),
                content: content.to_string(),
                message: commit_message(unit, &report.message),
            })
            .collect();
        tracing::info!(%branch, classes = commits.len(), "publishing fix");

        let workspace = Arc::clone(&self.collaborators.workspace);
        let task_branch = branch.clone();
        tokio::task::spawn_blocking(move || apply_commits(workspace.as_ref(), &task_branch, &commits))
            .await
            .context("Working copy task panicked")??;

        let units = fix_set.unit_names();
        let pr_url = self
            .collaborators
            .reviews
            .open_pull_request(&branch, &pr_title(primary, units.len()), &pr_body(report, &units))
            .await
            .context("Failed to create pull request")?;
        tracing::info!(%pr_url, "pull request opened");

        let ticket_url = self
            .collaborators
            .tickets
            .create_ticket(&ticket_summary(primary), &ticket_description(report, &pr_url, &units))
            .await
            .context("Failed to create tracking ticket")?;
        tracing::info!(%ticket_url, "tracking ticket created");

        Ok(pr_url)
    }
}

/// Branch, commit each unit in order, push. The working copy is released when
/// this returns, on success and on every error path.
fn apply_commits(
    workspace: &dyn WorkspaceProvider,
    branch: &str,
    commits: &[PlannedCommit],
) -> anyhow::Result<()> {
    let mut copy = workspace.open().context("Failed to prepare working copy")?;
    copy.create_branch(branch)?;
    for commit in commits {
        let id = copy
            .write_and_commit(&commit.unit, &commit.content, &commit.message)
            .with_context(|| format!("Failed to commit fix for {}", commit.unit))?;
        tracing::debug!(unit = %commit.unit, commit = %id, "committed fix");
    }
    copy.push(branch)
}

fn branch_suffix() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..BRANCH_SUFFIX_LEN].to_string()
}

fn commit_message(unit: &str, exception_message: &str) -> String {
    format!("Auto-fix {}: {}", unit, exception_message.trim())
}

fn pr_title(primary: &str, unit_count: usize) -> String {
    match unit_count.saturating_sub(1) {
        0 => format!("Fix {}", primary),
        1 => format!("Fix {} and 1 other class", primary),
        n => format!("Fix {} and {} other classes", primary, n),
    }
}

fn pr_body(report: &ExceptionReport, units: &[&str]) -> String {
    format!(
        "Auto-fix for: {}\n\nException record: {}\n\nFixed classes: {}",
        report.message.trim(),
        report.id,
        units.join(", ")
    )
}

fn ticket_summary(primary: &str) -> String {
    format!("[{}] Auto-fix PR created", primary)
}

fn ticket_description(report: &ExceptionReport, pr_url: &str, units: &[&str]) -> String {
    format!(
        "PR: {}\nException: {}\nFixed classes: {}\n\nPlease review and merge.",
        pr_url,
        report.message.trim(),
        units.join(", ")
    )
}
