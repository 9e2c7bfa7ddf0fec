use anyhow::{Context, Result};
use apex_autoheal::config::Config;
use apex_autoheal::git_ops::{GitWorkspace, GitWorkspaceSettings};
use apex_autoheal::github::{GitHubClient, GitHubSettings};
use apex_autoheal::jira::{JiraClient, JiraSettings};
use apex_autoheal::llm::{EinsteinClient, EinsteinSettings};
use apex_autoheal::pipeline::{Collaborators, PipelineSettings};
use apex_autoheal::salesforce::{SalesforceSettings, SalesforceStatusRecorder};
use apex_autoheal::{logging, server, ExceptionReport, RemediationPipeline};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "apex-autoheal",
    about = "Turn Apex runtime exceptions into reviewed fix pull requests",
    version
)]
struct Args {
    /// Path to a TOML config file (defaults to the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (AUTOHEAL_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve POST /solve over HTTP
    Serve {
        /// Listen address (overrides server.bind / AUTOHEAL_BIND)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Remediate one exception and print the pull request URL
    Run {
        /// Exception record id
        #[arg(long)]
        id: String,

        #[arg(long)]
        message: String,

        #[arg(long, conflicts_with = "stack_trace_file", required_unless_present = "stack_trace_file")]
        stack_trace: Option<String>,

        /// Read the stack trace from a file
        #[arg(long)]
        stack_trace_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose)?;

    let config = Config::load(args.config.as_deref())?;
    config.validate()?;
    let pipeline = Arc::new(build_pipeline(&config)?);

    match args.command {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            server::serve(pipeline, &bind).await
        }
        Command::Run {
            id,
            message,
            stack_trace,
            stack_trace_file,
        } => {
            let stack_trace = match (stack_trace, stack_trace_file) {
                (Some(trace), _) => trace,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, None) => anyhow::bail!("--stack-trace or --stack-trace-file is required"),
            };
            let report = ExceptionReport {
                id,
                message,
                stack_trace,
            };
            let pr_url = pipeline.remediate(&report).await?;
            println!("{}", pr_url);
            Ok(())
        }
    }
}

fn build_pipeline(config: &Config) -> Result<RemediationPipeline> {
    let (owner, repo) = config
        .repo_slug()
        .context("github.repo must look like owner/repo")?;
    let base_branch = config.github.branch.clone();

    let generator = EinsteinClient::new(EinsteinSettings::new(
        &config.salesforce.api_endpoint,
        config.salesforce.access_token.expose(),
        &config.salesforce.model_id,
    ))?;

    let github = Arc::new(GitHubClient::new(GitHubSettings {
        api_base: config.github.api_base.clone(),
        owner: owner.clone(),
        repo: repo.clone(),
        token: config.github.token.expose().to_string(),
        base_branch: base_branch.clone(),
        layout: config.layout.clone(),
    })?);

    let workspace = GitWorkspace::new(GitWorkspaceSettings {
        remote_url: GitWorkspaceSettings::github_remote(
            &format!("{}/{}", owner, repo),
            config.github.token.expose(),
        ),
        base_branch: base_branch.clone(),
        author_name: config.git.user_name.clone(),
        author_email: config.git.user_email.clone(),
        layout: config.layout.clone(),
    });

    let tickets = JiraClient::new(JiraSettings {
        base_url: config.jira.base_url.clone(),
        email: config.jira.email.clone(),
        api_token: config.jira.api_token.expose().to_string(),
        project_key: config.jira.project_key.clone(),
        issue_type: config.jira.issue_type.clone(),
    })?;

    let status = SalesforceStatusRecorder::new(SalesforceSettings {
        instance_url: config.salesforce.instance_url.clone(),
        access_token: config.salesforce.access_token.expose().to_string(),
    })?;

    Ok(RemediationPipeline::new(
        Collaborators {
            generator: Arc::new(generator),
            sources: github.clone(),
            workspace: Arc::new(workspace),
            reviews: github,
            tickets: Arc::new(tickets),
            status: Arc::new(status),
        },
        PipelineSettings {
            base_branch,
            layout: config.layout.clone(),
        },
    ))
}
