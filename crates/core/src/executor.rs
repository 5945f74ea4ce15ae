//! Tool Execution
//!
//! The concrete tools shell out to `git` and the GitHub CLI inside the
//! selected project. The relay only sees the `ToolExecutor` trait.

use crate::project::{LocalWorkspace, ProjectError};
use crate::tools::{
    COMMIT_CHANGES, CREATE_ISSUE, CommitChangesArgs, CreateIssueArgs, GIT_STATUS, LIST_ISSUES,
    ListIssuesArgs,
};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid arguments for '{function}': {source}")]
    InvalidArguments {
        function: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error("Unexpected command output: {0}")]
    UnexpectedOutput(String),
    #[error("Function '{0}' is not supported by this executor")]
    Unsupported(String),
}

/// The outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }
}

impl From<Result<Value, ToolError>> for ToolResult {
    fn from(result: Result<Value, ToolError>) -> Self {
        match result {
            Ok(data) => ToolResult::ok(data),
            Err(e) => ToolResult::failed(e.to_string()),
        }
    }
}

/// Runs a named tool against a project.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute_function(&self, project: &str, name: &str, args: &Value) -> ToolResult;
}

/// Executes the repository tools with `git` and `gh`.
pub struct CommandToolExecutor {
    workspace: LocalWorkspace,
}

impl CommandToolExecutor {
    pub fn new(workspace: LocalWorkspace) -> Self {
        Self { workspace }
    }

    async fn git_status(&self, path: &Path) -> Result<Value, ToolError> {
        let output = run_command("git", &["status", "--porcelain=v1", "--branch"], path).await?;
        Ok(parse_porcelain_status(&output))
    }

    async fn commit_changes(&self, path: &Path, args: CommitChangesArgs) -> Result<Value, ToolError> {
        if args.add_all {
            run_command("git", &["add", "--all"], path).await?;
        }
        let summary = run_command("git", &["commit", "-m", args.message.as_str()], path).await?;
        let commit = run_command("git", &["rev-parse", "--short", "HEAD"], path).await?;
        Ok(json!({
            "commit": commit.trim(),
            "summary": summary.lines().next().unwrap_or_default(),
        }))
    }

    async fn create_issue(&self, path: &Path, args: CreateIssueArgs) -> Result<Value, ToolError> {
        let body = args.body.unwrap_or_default();
        let mut cli_args = vec![
            "issue",
            "create",
            "--title",
            args.title.as_str(),
            "--body",
            body.as_str(),
        ];
        for label in &args.labels {
            cli_args.push("--label");
            cli_args.push(label.as_str());
        }
        let output = run_command("gh", &cli_args, path).await?;
        let url = output
            .lines()
            .rev()
            .find(|line| line.starts_with("http"))
            .unwrap_or(output.trim());
        Ok(json!({ "title": args.title, "url": url }))
    }

    async fn list_issues(&self, path: &Path, args: ListIssuesArgs) -> Result<Value, ToolError> {
        let state = args.state.unwrap_or_else(|| "open".to_string());
        let limit = args.limit.unwrap_or(10).to_string();
        let output = run_command(
            "gh",
            &[
                "issue",
                "list",
                "--state",
                state.as_str(),
                "--limit",
                limit.as_str(),
                "--json",
                "number,title,state,url",
            ],
            path,
        )
        .await?;
        let issues: Value = serde_json::from_str(&output)
            .map_err(|e| ToolError::UnexpectedOutput(format!("gh issue list: {e}")))?;
        Ok(json!({ "issues": issues }))
    }
}

#[async_trait]
impl ToolExecutor for CommandToolExecutor {
    async fn execute_function(&self, project: &str, name: &str, args: &Value) -> ToolResult {
        info!(%project, function = %name, "Executing tool");
        let result = async {
            let path = self.workspace.project_path(project).await?;
            match name {
                GIT_STATUS => self.git_status(&path).await,
                COMMIT_CHANGES => self.commit_changes(&path, parse_args(name, args)?).await,
                CREATE_ISSUE => self.create_issue(&path, parse_args(name, args)?).await,
                LIST_ISSUES => self.list_issues(&path, parse_args(name, args)?).await,
                other => Err(ToolError::Unsupported(other.to_string())),
            }
        }
        .await;
        if let Err(e) = &result {
            warn!(%project, function = %name, error = %e, "Tool failed");
        }
        result.into()
    }
}

/// Deserializes a tool's argument object into its typed form.
pub fn parse_args<T: DeserializeOwned>(function: &str, args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|source| ToolError::InvalidArguments {
        function: function.to_string(),
        source,
    })
}

/// Runs a command in `cwd` and returns its stdout, failing on a non-zero exit.
pub(crate) async fn run_command(
    program: &str,
    args: &[&str],
    cwd: &Path,
) -> Result<String, ProjectError> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .await?;
    if !output.status.success() {
        return Err(ProjectError::Command {
            command: format!("{} {}", program, args.first().unwrap_or(&"")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_porcelain_status(output: &str) -> Value {
    let mut branch = None;
    let mut changes = Vec::new();
    for line in output.lines() {
        if let Some(header) = line.strip_prefix("## ") {
            let name = header.split("...").next().unwrap_or(header);
            branch = Some(name.trim().to_string());
        } else if line.len() > 3 {
            let (status, path) = line.split_at(2);
            changes.push(json!({ "status": status.trim(), "path": path.trim() }));
        }
    }
    json!({
        "branch": branch,
        "clean": changes.is_empty(),
        "changes": changes,
    })
}
