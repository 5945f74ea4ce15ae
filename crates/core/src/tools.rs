//! Tool Catalog
//!
//! This module declares every function the dialogue model may call, together
//! with its parameter schema and dispatch category. The registry is built once
//! per process and is read-only afterwards, so it needs no locking.

use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

pub const LIST_PROJECTS: &str = "list_projects";
pub const SELECT_PROJECT: &str = "select_project";
pub const GET_PROJECT_STATUS: &str = "get_project_status";
pub const GIT_STATUS: &str = "git_status";
pub const COMMIT_CHANGES: &str = "commit_changes";
pub const CREATE_ISSUE: &str = "create_issue";
pub const LIST_ISSUES: &str = "list_issues";
pub const ASK_ADVISOR: &str = "ask_advisor";

/// How a tool's result flows back through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// The result is echoed to the dialogue model and a further response is requested.
    Standard,
    /// The result goes straight to the client; the dialogue model only gets an
    /// acknowledgment and is not asked to comment on it.
    SideChannel,
}

/// A static description of one callable tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    pub category: ToolCategory,
}

// --- Argument Types ---

/// Arguments for tools that take none.
#[derive(Deserialize, JsonSchema, Debug, Default)]
pub struct NoArgs {}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct SelectProjectArgs {
    /// Name of the repository directory to work in.
    pub project: String,
}

#[derive(Deserialize, JsonSchema, Debug, Default)]
pub struct ProjectStatusArgs {
    /// Repository to describe. Defaults to the selected project.
    pub project: Option<String>,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct CommitChangesArgs {
    /// The commit message.
    pub message: String,
    /// Stage every modified and untracked file before committing.
    #[serde(default)]
    pub add_all: bool,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct CreateIssueArgs {
    /// Issue title.
    pub title: String,
    /// Issue body in markdown.
    #[serde(default)]
    pub body: Option<String>,
    /// Labels to attach.
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Deserialize, JsonSchema, Debug, Default)]
pub struct ListIssuesArgs {
    /// One of 'open', 'closed' or 'all'.
    #[schemars(description = "Issue state filter: 'open', 'closed' or 'all'")]
    pub state: Option<String>,
    /// Maximum number of issues to return.
    pub limit: Option<u32>,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct AskAdvisorArgs {
    /// The question to ask about the repository.
    pub question: String,
}

/// Converts a derived schema into the plain object the realtime API expects.
fn parameters_for<T: JsonSchema>() -> Value {
    let mut value = serde_json::to_value(schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({ "type": "object" }));
    if let Some(object) = value.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
        object
            .entry("properties")
            .or_insert_with(|| Value::Object(Default::default()));
    }
    value
}

/// Process-wide lookup from function name to descriptor.
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    by_name: HashMap<&'static str, usize>,
}

static REGISTRY: LazyLock<ToolRegistry> = LazyLock::new(ToolRegistry::build);

impl ToolRegistry {
    /// Returns the shared registry.
    pub fn global() -> &'static ToolRegistry {
        &REGISTRY
    }

    fn build() -> Self {
        use ToolCategory::*;
        let tools = vec![
            ToolDescriptor {
                name: LIST_PROJECTS,
                description: "List the git repositories that can be selected as the active project.",
                parameters: parameters_for::<NoArgs>(),
                category: Standard,
            },
            ToolDescriptor {
                name: SELECT_PROJECT,
                description: "Select the repository that later commands operate on.",
                parameters: parameters_for::<SelectProjectArgs>(),
                category: Standard,
            },
            ToolDescriptor {
                name: GET_PROJECT_STATUS,
                description: "Describe a repository: full name, remote URL and current branch.",
                parameters: parameters_for::<ProjectStatusArgs>(),
                category: Standard,
            },
            ToolDescriptor {
                name: GIT_STATUS,
                description: "Show the current branch and the uncommitted changes of the selected project.",
                parameters: parameters_for::<NoArgs>(),
                category: Standard,
            },
            ToolDescriptor {
                name: COMMIT_CHANGES,
                description: "Commit the changes in the selected project with the given message.",
                parameters: parameters_for::<CommitChangesArgs>(),
                category: Standard,
            },
            ToolDescriptor {
                name: CREATE_ISSUE,
                description: "Create a GitHub issue in the selected project.",
                parameters: parameters_for::<CreateIssueArgs>(),
                category: Standard,
            },
            ToolDescriptor {
                name: LIST_ISSUES,
                description: "List GitHub issues of the selected project.",
                parameters: parameters_for::<ListIssuesArgs>(),
                category: Standard,
            },
            ToolDescriptor {
                name: ASK_ADVISOR,
                description: "Ask a specialist for advice about the selected project. The answer is shown to the user directly; do not repeat or summarize it.",
                parameters: parameters_for::<AskAdvisorArgs>(),
                category: SideChannel,
            },
        ];
        let by_name = tools
            .iter()
            .enumerate()
            .map(|(index, tool)| (tool.name, index))
            .collect();
        Self { tools, by_name }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.by_name.get(name).map(|&index| &self.tools[index])
    }

    pub fn category_of(&self, name: &str) -> Option<ToolCategory> {
        self.get(name).map(|tool| tool.category)
    }

    /// All descriptors, in declaration order.
    pub fn all(&self) -> &[ToolDescriptor] {
        &self.tools
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_every_declared_tool() {
        let registry = ToolRegistry::global();
        for tool in registry.all() {
            let found = registry.get(tool.name).expect("declared tool must resolve");
            assert_eq!(found.name, tool.name);
        }
        assert!(registry.get("drop_database").is_none());
    }

    #[test]
    fn test_only_advisor_is_side_channel() {
        let registry = ToolRegistry::global();
        let side_channel: Vec<_> = registry
            .all()
            .iter()
            .filter(|tool| tool.category == ToolCategory::SideChannel)
            .map(|tool| tool.name)
            .collect();
        assert_eq!(side_channel, vec![ASK_ADVISOR]);
        assert_eq!(
            registry.category_of(CREATE_ISSUE),
            Some(ToolCategory::Standard)
        );
    }

    #[test]
    fn test_parameter_schemas_are_plain_objects() {
        let registry = ToolRegistry::global();
        let issue = registry.get(CREATE_ISSUE).unwrap();
        let object = issue.parameters.as_object().expect("schema is an object");
        assert!(!object.contains_key("$schema"));
        assert!(object["properties"].get("title").is_some());
        let required = object["required"].as_array().expect("title is required");
        assert!(required.iter().any(|v| v == "title"));

        let status = registry.get(GIT_STATUS).unwrap();
        assert!(status.parameters["properties"].is_object());
    }
}
