//! Scoped git working copies for publishing fixes
//!
//! A working copy is a shallow clone in a temporary directory. Branch, stage and
//! commit go through git2; clone and push shell out to git because the remote
//! is reached over token-authenticated HTTPS.

use crate::layout::{is_valid_unit_name, UnitLayout};
use crate::util::{redact_url_credentials, run_command_with_timeout, CommandRunResult};
use anyhow::{Context, Result};
use git2::{Repository, Signature};
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;

const GIT_CLONE_TIMEOUT_SECS: u64 = 180;
const GIT_PUSH_TIMEOUT_SECS: u64 = 180;

/// Maximum length for git ref names
const MAX_GIT_REF_LENGTH: usize = 255;

/// A checked-out tree that fixes can be committed to.
///
/// Implementations release every resource they hold (including temporary
/// storage) when dropped.
pub trait WorkingCopy: Send {
    fn create_branch(&mut self, name: &str) -> Result<()>;

    /// Overwrite the file backing `unit` and commit it. Returns the commit id.
    fn write_and_commit(&mut self, unit: &str, content: &str, message: &str) -> Result<String>;

    fn push(&mut self, branch: &str) -> Result<()>;
}

/// Opens fresh working copies of the configured repository and base branch.
pub trait WorkspaceProvider: Send + Sync {
    fn open(&self) -> Result<Box<dyn WorkingCopy>>;
}

#[derive(Debug, Clone)]
pub struct GitWorkspaceSettings {
    /// Clone/push URL; may embed credentials.
    pub remote_url: String,
    pub base_branch: String,
    pub author_name: String,
    pub author_email: String,
    pub layout: UnitLayout,
}

impl GitWorkspaceSettings {
    /// Token-authenticated HTTPS remote for a GitHub `owner/repo`.
    pub fn github_remote(repo: &str, token: &str) -> String {
        format!("https://x-access-token:{}@github.com/{}.git", token, repo)
    }
}

/// Provider that shallow-clones the remote into a new temp dir per run.
pub struct GitWorkspace {
    settings: GitWorkspaceSettings,
}

impl GitWorkspace {
    pub fn new(settings: GitWorkspaceSettings) -> Self {
        Self { settings }
    }
}

impl WorkspaceProvider for GitWorkspace {
    fn open(&self) -> Result<Box<dyn WorkingCopy>> {
        let dir = tempfile::Builder::new()
            .prefix("apex-autoheal-")
            .tempdir()
            .context("Failed to create temporary directory for working copy")?;

        let mut cmd = Command::new("git");
        cmd.arg("clone")
            .arg("--depth")
            .arg("1")
            .arg("--branch")
            .arg(&self.settings.base_branch)
            .arg(&self.settings.remote_url)
            .arg(dir.path())
            .env("GIT_TERMINAL_PROMPT", "0");

        let output = run_command_with_timeout(&mut cmd, Duration::from_secs(GIT_CLONE_TIMEOUT_SECS))
            .map_err(|e| anyhow::anyhow!("Failed to run git clone: {}", e))?;
        ensure_git_success("git clone", &output, GIT_CLONE_TIMEOUT_SECS)?;

        tracing::debug!(path = %dir.path().display(), "cloned working copy");
        let copy = GitWorkingCopy::attach(dir, &self.settings)?;
        Ok(Box::new(copy))
    }
}

/// A git2 repository living inside a [`TempDir`] that is removed on drop.
pub struct GitWorkingCopy {
    dir: TempDir,
    remote_url: String,
    author_name: String,
    author_email: String,
    layout: UnitLayout,
}

impl GitWorkingCopy {
    /// Take ownership of an already checked-out repository in `dir`.
    pub fn attach(dir: TempDir, settings: &GitWorkspaceSettings) -> Result<Self> {
        let repo = open_repo(dir.path())?;
        let mut config = repo.config().context("Failed to read repository config")?;
        config.set_str("user.name", &settings.author_name)?;
        config.set_str("user.email", &settings.author_email)?;

        Ok(Self {
            dir,
            remote_url: settings.remote_url.clone(),
            author_name: settings.author_name.clone(),
            author_email: settings.author_email.clone(),
            layout: settings.layout.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl WorkingCopy for GitWorkingCopy {
    fn create_branch(&mut self, name: &str) -> Result<()> {
        if !is_valid_git_ref(name) {
            return Err(anyhow::anyhow!("Refusing to create invalid branch name '{}'", name));
        }
        create_branch_from_head(self.path(), name)
    }

    fn write_and_commit(&mut self, unit: &str, content: &str, message: &str) -> Result<String> {
        if !is_valid_unit_name(unit) {
            return Err(anyhow::anyhow!("Refusing to write invalid class name '{}'", unit));
        }
        let rel_path = self.layout.path_for(unit);
        let full_path = self.path().join(&rel_path);
        if !full_path.is_file() {
            return Err(anyhow::anyhow!("Class file not found: {}", rel_path));
        }

        std::fs::write(&full_path, content)
            .with_context(|| format!("Failed to write {}", rel_path))?;
        stage_file(self.path(), &rel_path)?;
        let oid = commit(self.path(), &self.author_name, &self.author_email, message)?;
        tracing::debug!(unit, path = %rel_path, commit = %oid, "committed fix");
        Ok(oid)
    }

    fn push(&mut self, branch: &str) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.current_dir(self.path())
            .arg("push")
            .arg(&self.remote_url)
            .arg(format!("{0}:refs/heads/{0}", branch))
            .env("GIT_TERMINAL_PROMPT", "0");

        let output = run_command_with_timeout(&mut cmd, Duration::from_secs(GIT_PUSH_TIMEOUT_SECS))
            .map_err(|e| anyhow::anyhow!("Failed to run git push: {}", e))?;
        ensure_git_success("git push", &output, GIT_PUSH_TIMEOUT_SECS)
            .with_context(|| format!("Failed to push branch '{}'", branch))
    }
}

fn ensure_git_success(label: &str, output: &CommandRunResult, timeout_secs: u64) -> Result<()> {
    if output.timed_out {
        return Err(anyhow::anyhow!("{} timed out after {}s", label, timeout_secs));
    }
    if output.success() {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "{} failed: {}",
        label,
        redact_url_credentials(output.stderr.trim())
    ))
}

fn open_repo(repo_path: &Path) -> Result<Repository> {
    Repository::open(repo_path).with_context(|| {
        format!(
            "Failed to open repository at '{}'",
            repo_path.display()
        )
    })
}

/// Checkout an existing branch
fn checkout_branch(repo: &Repository, name: &str) -> Result<()> {
    let (object, reference) = repo
        .revparse_ext(name)
        .context(format!("Branch '{}' not found", name))?;

    repo.checkout_tree(&object, None)?;

    match reference {
        Some(r) => repo.set_head(r.name().unwrap_or("HEAD"))?,
        None => repo.set_head_detached(object.id())?,
    }

    Ok(())
}

/// Create a new branch from HEAD and check it out.
fn create_branch_from_head(repo_path: &Path, branch_name: &str) -> Result<()> {
    let repo = open_repo(repo_path)?;
    if repo
        .find_branch(branch_name, git2::BranchType::Local)
        .is_ok()
    {
        return Err(anyhow::anyhow!("Branch '{}' already exists", branch_name));
    }

    let head_commit = repo
        .head()
        .context("Failed to get HEAD")?
        .peel_to_commit()
        .context("Failed to get commit from HEAD")?;

    repo.branch(branch_name, &head_commit, false)
        .context(format!("Failed to create branch '{}'", branch_name))?;

    if let Err(error) = checkout_branch(&repo, branch_name) {
        // Best-effort cleanup so branch creation is transactional.
        let _ = repo
            .find_branch(branch_name, git2::BranchType::Local)
            .and_then(|mut b| b.delete());
        return Err(anyhow::anyhow!(
            "Failed to checkout newly created branch '{}': {}",
            branch_name,
            error
        ));
    }

    Ok(())
}

/// Stage a specific file
fn stage_file(repo_path: &Path, file_path: &str) -> Result<()> {
    let repo = open_repo(repo_path)?;
    let mut index = repo.index()?;

    index.add_path(Path::new(file_path))?;
    index.write()?;

    Ok(())
}

/// Commit staged changes on top of HEAD
fn commit(repo_path: &Path, name: &str, email: &str, message: &str) -> Result<String> {
    let repo = open_repo(repo_path)?;
    let mut index = repo.index()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let parent = repo
        .head()
        .context("Failed to get HEAD")?
        .peel_to_commit()
        .context("Failed to get commit from HEAD")?;

    let sig = Signature::now(name, email)?;
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;

    Ok(oid.to_string())
}

/// Branch name for a fix of `unit`: `fix/<Unit>-<suffix>`.
pub fn generate_fix_branch_name(unit: &str, suffix: &str) -> String {
    let fallback = format!("fix/auto-{}", suffix);

    let slug = sanitize_branch_slug(unit);
    if slug.is_empty() {
        return fallback;
    }

    let candidate = format!("fix/{}-{}", slug, suffix);
    if is_valid_git_ref(&candidate) {
        candidate
    } else {
        fallback
    }
}

fn sanitize_branch_slug(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    let slug = if slug.chars().count() > 60 {
        slug.chars().take(60).collect::<String>()
    } else {
        slug
    };

    slug.trim_matches('-').to_string()
}

pub fn is_valid_git_ref(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_GIT_REF_LENGTH {
        return false;
    }

    // Could be interpreted as a git flag
    if name.starts_with('-') {
        return false;
    }

    if name.starts_with('.') || name.ends_with('.') || name.ends_with('/') {
        return false;
    }

    if name.ends_with(".lock") {
        return false;
    }

    if name.contains("..") || name.contains("@{") || name.contains("//") {
        return false;
    }

    for c in name.chars() {
        if c.is_control()
            || matches!(
                c,
                ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\' | '\'' | '"' | '`' | '$' | '!'
                    | '&' | ';' | '|' | '<' | '>'
            )
        {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::RepositoryInitOptions;

    const CLASS_PATH: &str = "force-app/main/default/classes/Foo.cls";

    fn settings(remote_url: &str) -> GitWorkspaceSettings {
        GitWorkspaceSettings {
            remote_url: remote_url.to_string(),
            base_branch: "main".to_string(),
            author_name: "Self-Healing Agent".to_string(),
            author_email: "selfhealing@example.com".to_string(),
            layout: UnitLayout::default(),
        }
    }

    /// Helper to create a repository on `main` with one committed class
    fn init_repo_with_class(path: &Path) -> Repository {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path, &opts).expect("Failed to init repo");

        let full_path = path.join(CLASS_PATH);
        std::fs::create_dir_all(full_path.parent().unwrap()).unwrap();
        std::fs::write(&full_path, "public class Foo {}").unwrap();

        {
            let mut index = repo.index().unwrap();
            index.add_path(Path::new(CLASS_PATH)).unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = Signature::now("Test User", "test@example.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
                .unwrap();
        }
        repo
    }

    fn attached_copy() -> GitWorkingCopy {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_class(dir.path());
        GitWorkingCopy::attach(dir, &settings("https://example.invalid/repo.git")).unwrap()
    }

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_branch_name_uses_unit_and_suffix() {
        assert_eq!(generate_fix_branch_name("Foo", "1a2b3c4d"), "fix/Foo-1a2b3c4d");
        assert_eq!(
            generate_fix_branch_name("Account_Service", "deadbeef"),
            "fix/Account_Service-deadbeef"
        );
    }

    #[test]
    fn test_branch_name_fallback_on_empty_slug() {
        assert_eq!(generate_fix_branch_name("..//", "1a2b3c4d"), "fix/auto-1a2b3c4d");
    }

    #[test]
    fn test_branch_name_sanitizes_special_chars() {
        assert_eq!(generate_fix_branch_name("Foo Bar:baz", "0000"), "fix/Foo-Bar-baz-0000");
    }

    #[test]
    fn test_invalid_git_ref_rejected() {
        assert!(!is_valid_git_ref(""));
        assert!(!is_valid_git_ref("-delete"));
        assert!(!is_valid_git_ref("fix/../main"));
        assert!(!is_valid_git_ref("fix/foo.lock"));
        assert!(!is_valid_git_ref("fix/foo bar"));
        assert!(!is_valid_git_ref("fix/foo;rm"));
        assert!(!is_valid_git_ref(&"a".repeat(300)));
    }

    #[test]
    fn test_valid_git_refs_accepted() {
        assert!(is_valid_git_ref("main"));
        assert!(is_valid_git_ref("fix/Foo-1a2b3c4d"));
        assert!(is_valid_git_ref("feature/a_b-c"));
    }

    #[test]
    fn test_create_branch_checks_out_new_branch() {
        let mut copy = attached_copy();
        copy.create_branch("fix/Foo-1a2b3c4d").unwrap();

        let repo = Repository::open(copy.path()).unwrap();
        let head = repo.head().unwrap();
        assert_eq!(head.shorthand(), Some("fix/Foo-1a2b3c4d"));
    }

    #[test]
    fn test_create_branch_rejects_existing_and_invalid_names() {
        let mut copy = attached_copy();
        copy.create_branch("fix/Foo-1").unwrap();
        assert!(copy.create_branch("fix/Foo-1").is_err());
        assert!(copy.create_branch("bad name").is_err());
    }

    #[test]
    fn test_write_and_commit_overwrites_file_with_message() {
        let mut copy = attached_copy();
        copy.create_branch("fix/Foo-1").unwrap();
        let oid = copy
            .write_and_commit("Foo", "public class Foo { /* fixed */ }", "Auto-fix Foo: NPE")
            .unwrap();

        let repo = Repository::open(copy.path()).unwrap();
        let head_commit = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head_commit.id().to_string(), oid);
        assert_eq!(head_commit.message(), Some("Auto-fix Foo: NPE"));
        assert_eq!(head_commit.author().name(), Some("Self-Healing Agent"));
        assert_eq!(head_commit.parent_count(), 1);

        let on_disk = std::fs::read_to_string(copy.path().join(CLASS_PATH)).unwrap();
        assert_eq!(on_disk, "public class Foo { /* fixed */ }");

        let statuses = repo.statuses(None).unwrap();
        assert!(statuses.is_empty(), "working tree should be clean after commit");
    }

    #[test]
    fn test_write_and_commit_rejects_missing_class() {
        let mut copy = attached_copy();
        let err = copy
            .write_and_commit("Missing", "class Missing {}", "Auto-fix Missing")
            .unwrap_err();
        assert!(err.to_string().contains("Class file not found"));
    }

    #[test]
    fn test_write_and_commit_rejects_path_like_units() {
        let mut copy = attached_copy();
        assert!(copy
            .write_and_commit("../../etc/passwd", "x", "nope")
            .is_err());
    }

    #[test]
    fn test_dropping_working_copy_removes_temp_dir() {
        let copy = attached_copy();
        let path = copy.path().to_path_buf();
        assert!(path.exists());
        drop(copy);
        assert!(!path.exists());
    }

    #[test]
    fn test_open_clone_commit_and_push_roundtrip() {
        if !git_available() {
            return;
        }
        let origin_dir = tempfile::tempdir().unwrap();
        init_repo_with_class(origin_dir.path());
        let remote_url = format!("file://{}", origin_dir.path().display());

        let workspace = GitWorkspace::new(settings(&remote_url));
        let mut copy = workspace.open().unwrap();
        copy.create_branch("fix/Foo-cafebabe").unwrap();
        copy.write_and_commit("Foo", "public class Foo { fixed }", "Auto-fix Foo: NPE")
            .unwrap();
        copy.push("fix/Foo-cafebabe").unwrap();
        drop(copy);

        let origin = Repository::open(origin_dir.path()).unwrap();
        let branch = origin
            .find_branch("fix/Foo-cafebabe", git2::BranchType::Local)
            .expect("pushed branch should exist on origin");
        let commit = branch.get().peel_to_commit().unwrap();
        assert_eq!(commit.message(), Some("Auto-fix Foo: NPE"));
    }

    #[test]
    fn test_open_reports_clone_failure_without_credentials() {
        if !git_available() {
            return;
        }
        let missing = tempfile::tempdir().unwrap();
        let remote_url = format!("file://{}/nope.git", missing.path().display());

        let err = match GitWorkspace::new(settings(&remote_url)).open() {
            Ok(_) => panic!("clone of a missing remote should fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("git clone failed"));
    }
}
