//! Project Discovery and Status
//!
//! A "project" is a git repository living directly under the configured
//! workspace root. The relay only needs to validate a selection and describe
//! a repository; everything else about projects belongs to the tools.

use crate::executor::run_command;
use async_trait::async_trait;
use fuzzy_matcher::{FuzzyMatcher, skim::SkimMatcherV2};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("Project '{name}' not found{}", suggestion_suffix(.suggestion))]
    NotFound {
        name: String,
        suggestion: Option<String>,
    },
    #[error("No project selected. Select a project first.")]
    NoProjectSelected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(". Did you mean '{s}'?"))
        .unwrap_or_default()
}

/// A description of one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub name: String,
    /// `owner/repo` when the origin remote points at a known host.
    pub full_name: Option<String>,
    pub url: Option<String>,
    pub branch: Option<String>,
    pub path: PathBuf,
}

/// The project bookkeeping the relay depends on.
#[async_trait]
pub trait ProjectManager: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<String>, ProjectError>;

    /// Validates that `name` can become the active project.
    async fn select_project(&self, name: &str) -> Result<(), ProjectError>;

    async fn project_status(&self, name: &str) -> Result<ProjectStatus, ProjectError>;
}

/// Discovers projects as git repositories under a root directory.
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves a project name to its directory, refusing anything that is
    /// not a direct child repository of the root.
    pub async fn project_path(&self, name: &str) -> Result<PathBuf, ProjectError> {
        let not_found = |suggestion| ProjectError::NotFound {
            name: name.to_string(),
            suggestion,
        };
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(not_found(None));
        }
        let path = self.root.join(name);
        if tokio::fs::try_exists(path.join(".git")).await? {
            return Ok(path);
        }
        let candidates = self.list_projects().await?;
        Err(not_found(closest_match(name, &candidates)))
    }
}

#[async_trait]
impl ProjectManager for LocalWorkspace {
    async fn list_projects(&self) -> Result<Vec<String>, ProjectError> {
        let mut projects = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if tokio::fs::try_exists(entry.path().join(".git")).await? {
                if let Some(name) = entry.file_name().to_str() {
                    projects.push(name.to_string());
                }
            }
        }
        projects.sort();
        debug!(root = %self.root.display(), count = projects.len(), "Listed projects");
        Ok(projects)
    }

    async fn select_project(&self, name: &str) -> Result<(), ProjectError> {
        self.project_path(name).await?;
        info!(project = %name, "Project selected");
        Ok(())
    }

    async fn project_status(&self, name: &str) -> Result<ProjectStatus, ProjectError> {
        let path = self.project_path(name).await?;
        let branch = run_command("git", &["rev-parse", "--abbrev-ref", "HEAD"], &path)
            .await
            .ok()
            .map(|out| out.trim().to_string());
        let url = run_command("git", &["remote", "get-url", "origin"], &path)
            .await
            .ok()
            .map(|out| out.trim().to_string())
            .filter(|url| !url.is_empty());
        let full_name = url.as_deref().and_then(full_name_from_remote);
        Ok(ProjectStatus {
            name: name.to_string(),
            full_name,
            url,
            branch,
            path,
        })
    }
}

/// Extracts `owner/repo` from an ssh or https remote URL.
pub fn full_name_from_remote(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let path = match trimmed.split_once("://") {
        Some((_, rest)) => rest.split_once('/')?.1,
        None => trimmed.split_once(':')?.1,
    };
    let mut segments = path.rsplit('/');
    let repo = segments.next().filter(|s| !s.is_empty())?;
    let owner = segments.next().filter(|s| !s.is_empty())?;
    Some(format!("{owner}/{repo}"))
}

fn closest_match(name: &str, candidates: &[String]) -> Option<String> {
    let matcher = SkimMatcherV2::default();
    candidates
        .iter()
        .filter_map(|candidate| {
            matcher
                .fuzzy_match(candidate, name)
                .map(|score| (score, candidate))
        })
        .max_by_key(|(score, _)| *score)
        .map(|(_, candidate)| candidate.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace_with(repos: &[&str]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for repo in repos {
            std::fs::create_dir_all(dir.path().join(repo).join(".git")).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("not-a-repo")).unwrap();
        dir
    }

    #[test]
    fn test_full_name_from_remote() {
        assert_eq!(
            full_name_from_remote("git@github.com:octo/widgets.git").as_deref(),
            Some("octo/widgets")
        );
        assert_eq!(
            full_name_from_remote("https://github.com/octo/widgets").as_deref(),
            Some("octo/widgets")
        );
        assert_eq!(full_name_from_remote("not a url"), None);
    }

    #[tokio::test]
    async fn test_list_projects_only_returns_repositories() {
        let dir = workspace_with(&["beta", "alpha"]);
        let workspace = LocalWorkspace::new(dir.path());
        let projects = workspace.list_projects().await.unwrap();
        assert_eq!(projects, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[tokio::test]
    async fn test_select_unknown_project_suggests_close_name() {
        let dir = workspace_with(&["voice-repo"]);
        let workspace = LocalWorkspace::new(dir.path());

        assert!(workspace.select_project("voice-repo").await.is_ok());

        let err = workspace.select_project("voicerepo").await.unwrap_err();
        match err {
            ProjectError::NotFound { name, suggestion } => {
                assert_eq!(name, "voicerepo");
                assert_eq!(suggestion.as_deref(), Some("voice-repo"));
            }
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_select_rejects_paths_outside_root() {
        let dir = workspace_with(&["alpha"]);
        let workspace = LocalWorkspace::new(dir.path());
        assert!(matches!(
            workspace.select_project("../alpha").await,
            Err(ProjectError::NotFound { .. })
        ));
        assert!(matches!(
            workspace.select_project("..").await,
            Err(ProjectError::NotFound { .. })
        ));
    }
}
