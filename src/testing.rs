//! In-memory collaborators for unit and integration tests.
//!
//! Every fake records what it was asked to do so tests can assert on the
//! exact sequence of external effects.

use crate::error::SourceError;
use crate::git_ops::{WorkingCopy, WorkspaceProvider};
use crate::layout::UnitLayout;
use crate::llm::{CompletionOptions, Conversation, Generator};
use crate::pipeline::{RemediationOutcome, ReviewPublisher, StatusRecorder, TicketTracker};
use crate::source::SourceReader;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Poisoning only happens after a panic in another test thread; keep going.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct FakeSourceReader {
    units: HashMap<String, String>,
    failures: HashMap<String, String>,
    reads: Mutex<Vec<String>>,
    layout: UnitLayout,
}

impl FakeSourceReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, unit: &str, content: &str) -> Self {
        self.units.insert(unit.to_string(), content.to_string());
        self
    }

    /// Reads of `unit` fail with a transport error instead of "not found".
    pub fn with_failure(mut self, unit: &str, reason: &str) -> Self {
        self.failures.insert(unit.to_string(), reason.to_string());
        self
    }

    pub fn read_count(&self, unit: &str) -> usize {
        lock(&self.reads).iter().filter(|u| *u == unit).count()
    }

    pub fn total_reads(&self) -> usize {
        lock(&self.reads).len()
    }
}

#[async_trait]
impl SourceReader for FakeSourceReader {
    async fn read(&self, unit: &str, _branch_ref: &str) -> Result<String, SourceError> {
        lock(&self.reads).push(unit.to_string());
        if let Some(reason) = self.failures.get(unit) {
            return Err(SourceError::FetchFailed {
                unit: unit.to_string(),
                reason: reason.clone(),
            });
        }
        self.units
            .get(unit)
            .cloned()
            .ok_or_else(|| SourceError::UnitNotFound {
                unit: unit.to_string(),
                path: self.layout.path_for(unit),
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GENERATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Replays a fixed script of replies and snapshots every conversation it sees.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, String>>>,
    seen: Mutex<Vec<(Conversation, CompletionOptions)>>,
}

impl ScriptedGenerator {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_results(replies.into_iter().map(|r| Ok(r.into())).collect())
    }

    /// `Err` entries surface as transport failures.
    pub fn from_results(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        lock(&self.seen).len()
    }

    /// Conversation as it stood at each call, in call order.
    pub fn conversations(&self) -> Vec<Conversation> {
        lock(&self.seen).iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn options(&self) -> Vec<CompletionOptions> {
        lock(&self.seen).iter().map(|(_, o)| *o).collect()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn complete(
        &self,
        conversation: &Conversation,
        options: CompletionOptions,
    ) -> Result<String> {
        lock(&self.seen).push((conversation.clone(), options));
        match lock(&self.replies).pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted generator has no replies left")),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WORKING COPY
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceEvent {
    Opened,
    Branch(String),
    Commit {
        unit: String,
        content: String,
        message: String,
    },
    Pushed(String),
    Released,
}

#[derive(Default)]
struct WorkspaceFailures {
    open: Option<String>,
    commit_unit: Option<String>,
    push: Option<String>,
}

/// Records working copy operations; copies log `Released` when dropped.
#[derive(Default)]
pub struct FakeWorkspace {
    events: Arc<Mutex<Vec<WorkspaceEvent>>>,
    failures: Mutex<WorkspaceFailures>,
}

impl FakeWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(&self, reason: &str) {
        lock(&self.failures).open = Some(reason.to_string());
    }

    /// Committing `unit` fails, e.g. because the class file does not exist.
    pub fn fail_commit_of(&self, unit: &str) {
        lock(&self.failures).commit_unit = Some(unit.to_string());
    }

    pub fn fail_push(&self, reason: &str) {
        lock(&self.failures).push = Some(reason.to_string());
    }

    pub fn events(&self) -> Vec<WorkspaceEvent> {
        lock(&self.events).clone()
    }

    /// `(unit, content, message)` for every commit, in order.
    pub fn commits(&self) -> Vec<(String, String, String)> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                WorkspaceEvent::Commit {
                    unit,
                    content,
                    message,
                } => Some((unit.clone(), content.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }
}

impl WorkspaceProvider for FakeWorkspace {
    fn open(&self) -> Result<Box<dyn WorkingCopy>> {
        let failures = lock(&self.failures);
        if let Some(reason) = &failures.open {
            return Err(anyhow!("git clone failed: {}", reason));
        }
        lock(&self.events).push(WorkspaceEvent::Opened);
        Ok(Box::new(FakeWorkingCopy {
            events: Arc::clone(&self.events),
            commit_failure: failures.commit_unit.clone(),
            push_failure: failures.push.clone(),
            commits: 0,
        }))
    }
}

struct FakeWorkingCopy {
    events: Arc<Mutex<Vec<WorkspaceEvent>>>,
    commit_failure: Option<String>,
    push_failure: Option<String>,
    commits: usize,
}

impl WorkingCopy for FakeWorkingCopy {
    fn create_branch(&mut self, name: &str) -> Result<()> {
        lock(&self.events).push(WorkspaceEvent::Branch(name.to_string()));
        Ok(())
    }

    fn write_and_commit(&mut self, unit: &str, content: &str, message: &str) -> Result<String> {
        if self.commit_failure.as_deref() == Some(unit) {
            return Err(anyhow!("Class file not found: {}", UnitLayout::default().path_for(unit)));
        }
        lock(&self.events).push(WorkspaceEvent::Commit {
            unit: unit.to_string(),
            content: content.to_string(),
            message: message.to_string(),
        });
        self.commits += 1;
        Ok(format!("{:040x}", self.commits))
    }

    fn push(&mut self, branch: &str) -> Result<()> {
        if let Some(reason) = &self.push_failure {
            return Err(anyhow!("git push failed: {}", reason));
        }
        lock(&self.events).push(WorkspaceEvent::Pushed(branch.to_string()));
        Ok(())
    }
}

impl Drop for FakeWorkingCopy {
    fn drop(&mut self) {
        lock(&self.events).push(WorkspaceEvent::Released);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REVIEW / TICKET / STATUS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestCall {
    pub branch: String,
    pub title: String,
    pub body: String,
}

#[derive(Default)]
pub struct FakeReviewPublisher {
    calls: Mutex<Vec<PullRequestCall>>,
    failure: Mutex<Option<String>>,
}

impl FakeReviewPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, reason: &str) {
        *lock(&self.failure) = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<PullRequestCall> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ReviewPublisher for FakeReviewPublisher {
    async fn open_pull_request(&self, branch: &str, title: &str, body: &str) -> Result<String> {
        let mut calls = lock(&self.calls);
        calls.push(PullRequestCall {
            branch: branch.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        });
        if let Some(reason) = lock(&self.failure).as_ref() {
            return Err(anyhow!("GitHub API error (422): {}", reason));
        }
        Ok(format!("https://github.com/acme/app/pull/{}", calls.len()))
    }
}

#[derive(Default)]
pub struct FakeTicketTracker {
    calls: Mutex<Vec<(String, String)>>,
    failure: Mutex<Option<String>>,
}

impl FakeTicketTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, reason: &str) {
        *lock(&self.failure) = Some(reason.to_string());
    }

    /// `(summary, description)` per ticket.
    pub fn calls(&self) -> Vec<(String, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl TicketTracker for FakeTicketTracker {
    async fn create_ticket(&self, summary: &str, description: &str) -> Result<String> {
        let mut calls = lock(&self.calls);
        calls.push((summary.to_string(), description.to_string()));
        if let Some(reason) = lock(&self.failure).as_ref() {
            return Err(anyhow!("Jira API error (400): {}", reason));
        }
        Ok(format!("https://acme.atlassian.net/browse/OPS-{}", calls.len()))
    }
}

#[derive(Default)]
pub struct FakeStatusRecorder {
    calls: Mutex<Vec<(String, RemediationOutcome)>>,
    failure: Mutex<Option<String>>,
    rejected_ids: Mutex<Vec<String>>,
}

impl FakeStatusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, reason: &str) {
        *lock(&self.failure) = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<(String, RemediationOutcome)> {
        lock(&self.calls).clone()
    }

    /// Treat `exception_id` as an id no record exists for.
    pub fn reject_id(&self, exception_id: &str) {
        lock(&self.rejected_ids).push(exception_id.to_string());
    }
}

#[async_trait]
impl StatusRecorder for FakeStatusRecorder {
    fn validate_id(&self, exception_id: &str) -> Result<()> {
        if lock(&self.rejected_ids).iter().any(|id| id == exception_id) {
            return Err(anyhow!("Invalid Salesforce record id: {:?}", exception_id));
        }
        Ok(())
    }

    async fn record(&self, exception_id: &str, outcome: &RemediationOutcome) -> Result<()> {
        lock(&self.calls).push((exception_id.to_string(), outcome.clone()));
        match lock(&self.failure).as_ref() {
            Some(reason) => Err(anyhow!("Salesforce update failed (401): {}", reason)),
            None => Ok(()),
        }
    }
}
