//! Resolves function calls against the tool catalog and runs them through the
//! project, tool and advisor collaborators.

use crate::error::RelayError;
use gitvoice_core::{
    advisor::Advisor,
    executor::{ToolExecutor, ToolResult, parse_args},
    generic_types::FunctionCall,
    project::{ProjectError, ProjectManager},
    tools::{
        ASK_ADVISOR, AskAdvisorArgs, GET_PROJECT_STATUS, LIST_PROJECTS, ProjectStatusArgs,
        SELECT_PROJECT, SelectProjectArgs, ToolCategory, ToolRegistry,
    },
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

/// The classified result of one dispatched call.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub function: String,
    pub category: ToolCategory,
    pub success: bool,
    pub data: Option<Value>,
    pub message: Option<String>,
    /// Set when the call successfully bound a new active project.
    pub selected_project: Option<String>,
}

impl Outcome {
    fn from_result(function: &str, category: ToolCategory, result: ToolResult) -> Self {
        Self {
            function: function.to_string(),
            category,
            success: result.success,
            data: result.data,
            message: result.message,
            selected_project: None,
        }
    }

    fn failure(function: &str, category: ToolCategory, message: impl Into<String>) -> Self {
        Self::from_result(function, category, ToolResult::failed(message))
    }

    /// The human-readable result shown to the client.
    pub fn client_result(&self) -> Value {
        match (&self.data, &self.message) {
            (Some(data), _) => data.clone(),
            (None, Some(message)) => Value::String(message.clone()),
            (None, None) => Value::Null,
        }
    }

    /// The machine-readable output returned to the dialogue model.
    pub fn upstream_output(&self) -> String {
        let output = if self.success {
            json!({ "success": true, "data": self.data })
        } else {
            json!({ "success": false, "error": self.message })
        };
        output.to_string()
    }
}

fn collaborator_failure(function: &str, category: ToolCategory, err: impl std::fmt::Display) -> Outcome {
    Outcome::failure(function, category, RelayError::Tool(err.to_string()).to_string())
}

/// Runs function calls. Holds no session state; the caller passes in the
/// project the call is scoped to.
pub struct FunctionDispatcher {
    registry: &'static ToolRegistry,
    projects: Arc<dyn ProjectManager>,
    executor: Arc<dyn ToolExecutor>,
    advisor: Arc<dyn Advisor>,
}

impl FunctionDispatcher {
    pub fn new(
        projects: Arc<dyn ProjectManager>,
        executor: Arc<dyn ToolExecutor>,
        advisor: Arc<dyn Advisor>,
    ) -> Self {
        Self {
            registry: ToolRegistry::global(),
            projects,
            executor,
            advisor,
        }
    }

    /// Executes `call` scoped to `current_project` and classifies the result.
    pub async fn dispatch(&self, current_project: Option<&str>, call: &FunctionCall) -> Outcome {
        let Some(tool) = self.registry.get(&call.name) else {
            warn!(function = %call.name, "Unknown function requested");
            return Outcome::failure(&call.name, ToolCategory::Standard, "unknown function");
        };
        let category = tool.category;
        info!(function = %call.name, call_id = %call.call_id, project = ?current_project, "Dispatching function call");

        match tool.name {
            LIST_PROJECTS => match self.projects.list_projects().await {
                Ok(projects) => Outcome::from_result(
                    tool.name,
                    category,
                    ToolResult::ok(json!({ "projects": projects })),
                ),
                Err(e) => collaborator_failure(tool.name, category, e),
            },
            SELECT_PROJECT => match parse_args::<SelectProjectArgs>(tool.name, &call.arguments) {
                Ok(args) => self.select_project(&args.project).await,
                Err(e) => Outcome::failure(tool.name, category, e.to_string()),
            },
            GET_PROJECT_STATUS => {
                let requested = parse_args::<ProjectStatusArgs>(tool.name, &call.arguments)
                    .ok()
                    .and_then(|args| args.project);
                let Some(project) = requested.as_deref().or(current_project) else {
                    return collaborator_failure(tool.name, category, ProjectError::NoProjectSelected);
                };
                match self.projects.project_status(project).await {
                    Ok(status) => Outcome::from_result(
                        tool.name,
                        category,
                        ToolResult::ok(serde_json::to_value(status).unwrap_or_default()),
                    ),
                    Err(e) => collaborator_failure(tool.name, category, e),
                }
            }
            ASK_ADVISOR => match parse_args::<AskAdvisorArgs>(tool.name, &call.arguments) {
                Ok(args) => self.ask_advisor(current_project, &args.question).await,
                Err(e) => Outcome::failure(tool.name, category, e.to_string()),
            },
            name => {
                let Some(project) = current_project else {
                    return collaborator_failure(name, category, ProjectError::NoProjectSelected);
                };
                let result = self
                    .executor
                    .execute_function(project, name, &call.arguments)
                    .await;
                Outcome::from_result(name, category, result)
            }
        }
    }

    /// Validates `name` as the active project. Shared by the `select_project`
    /// tool and the client's `select_project` intent.
    pub async fn select_project(&self, name: &str) -> Outcome {
        if let Err(e) = self.projects.select_project(name).await {
            warn!(project = %name, error = %e, "Project selection failed");
            return collaborator_failure(SELECT_PROJECT, ToolCategory::Standard, e);
        }
        let data = match self.projects.project_status(name).await {
            Ok(status) => serde_json::to_value(status).unwrap_or_default(),
            Err(_) => json!({ "name": name }),
        };
        let mut outcome =
            Outcome::from_result(SELECT_PROJECT, ToolCategory::Standard, ToolResult::ok(data));
        outcome.selected_project = Some(name.to_string());
        outcome
    }

    async fn ask_advisor(&self, current_project: Option<&str>, question: &str) -> Outcome {
        let repository = match current_project {
            Some(project) => self.projects.project_status(project).await.ok(),
            None => None,
        };
        match self.advisor.advise(question, repository.as_ref()).await {
            Ok(advice) => {
                let repository_name = repository
                    .as_ref()
                    .map(|r| r.full_name.clone().unwrap_or_else(|| r.name.clone()));
                Outcome::from_result(
                    ASK_ADVISOR,
                    ToolCategory::SideChannel,
                    ToolResult::ok(json!({
                        "question": question,
                        "advice": advice,
                        "repository": repository_name,
                    })),
                )
            }
            Err(e) => collaborator_failure(ASK_ADVISOR, ToolCategory::SideChannel, e),
        }
    }
}
