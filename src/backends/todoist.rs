//! Todoist REST driver. Projects map to lists, labels to categories.
//!
//! Error mapping follows the failure policy: 429 and 5xx are transient,
//! 401/403 are auth failures, remaining 4xx are permanent.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backends::{unsupported, CapabilitySet, TaskManager};
use crate::models::{Task, TaskList, TaskStatus};
use crate::utils::error::{TodoError, TodoResult};

const DEFAULT_BASE_URL: &str = "https://api.todoist.com/rest/v2";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TodoistBackend {
    name: String,
    base_url: String,
    token: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct Project {
    id: String,
    name: String,
    #[serde(default)]
    color: String,
}

#[derive(Debug, Deserialize)]
struct RemoteTask {
    id: String,
    project_id: String,
    content: String,
    #[serde(default)]
    description: String,
    /// Todoist: 1 = normal .. 4 = urgent.
    #[serde(default)]
    priority: u8,
    #[serde(default)]
    labels: Vec<String>,
    parent_id: Option<String>,
    due: Option<Due>,
    #[serde(default)]
    is_completed: bool,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Due {
    date: String,
}

#[derive(Debug, Serialize)]
struct TaskPayload {
    content: String,
    description: String,
    priority: u8,
    labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<String>,
}

impl TodoistBackend {
    pub fn new(name: &str, token: String) -> TodoResult<Self> {
        Self::with_base_url(name, token, DEFAULT_BASE_URL)
    }

    /// Test seam: point the driver at a local mock server.
    pub fn with_base_url(name: &str, token: String, base_url: &str) -> TodoResult<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(TodoError::from)?;
        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    async fn check(&self, operation: &str, response: reqwest::Response) -> TodoResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TodoError::from_http_status(operation, status.as_u16(), &body))
    }

    fn to_list(project: Project) -> TaskList {
        TaskList {
            uid: project.id,
            name: project.name,
            description: String::new(),
            color: project.color,
            modified: Utc::now(),
            deleted_at: None,
        }
    }

    fn to_task(&self, remote: RemoteTask) -> Task {
        let status = if remote.is_completed {
            TaskStatus::Completed
        } else {
            TaskStatus::NeedsAction
        };
        let created = remote.created_at.unwrap_or_else(Utc::now);
        let modified = remote.updated_at.unwrap_or(created);
        let due = remote.due.and_then(|d| {
            NaiveDate::parse_from_str(&d.date, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        });
        Task {
            uid: remote.id,
            list_uid: remote.project_id,
            summary: remote.content,
            description: remote.description,
            status,
            priority: from_todoist_priority(remote.priority),
            due,
            start: None,
            completed: (status == TaskStatus::Completed).then(|| modified),
            categories: remote.labels,
            parent_uid: remote.parent_id,
            created,
            modified,
            recurrence: None,
            local_id: None,
        }
    }

    fn payload(task: &Task, project_id: Option<String>) -> TaskPayload {
        TaskPayload {
            content: task.summary.clone(),
            description: task.description.clone(),
            priority: to_todoist_priority(task.priority),
            labels: task.categories.clone(),
            project_id,
            parent_id: task.parent_uid.clone(),
            due_date: task.due.map(|d| d.format("%Y-%m-%d").to_string()),
        }
    }

    /// Completion is a separate endpoint pair on this API.
    async fn set_completion(&self, uid: &str, completed: bool) -> TodoResult<()> {
        let action = if completed { "close" } else { "reopen" };
        let response = self
            .request(Method::POST, &format!("/tasks/{uid}/{action}"))
            .send()
            .await?;
        self.check(action, response).await?;
        Ok(())
    }
}

/// Ours: 0 unset, 1 highest .. 9 lowest. Todoist: 1 normal .. 4 urgent.
fn to_todoist_priority(priority: u8) -> u8 {
    match priority {
        0 => 1,
        1 => 4,
        2..=3 => 3,
        4..=6 => 2,
        _ => 1,
    }
}

fn from_todoist_priority(priority: u8) -> u8 {
    match priority {
        4 => 1,
        3 => 2,
        2 => 5,
        _ => 0,
    }
}

#[async_trait]
impl TaskManager for TodoistBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            trash: false,
            priority: true,
            subtasks: true,
            categories: true,
            start_date: false,
            recurrence: false,
            sharing: true,
        }
    }

    async fn get_lists(&self) -> TodoResult<Vec<TaskList>> {
        let response = self.request(Method::GET, "/projects").send().await?;
        let projects: Vec<Project> = self.check("get_lists", response).await?.json().await?;
        Ok(projects.into_iter().map(Self::to_list).collect())
    }

    async fn get_list(&self, uid: &str) -> TodoResult<Option<TaskList>> {
        let response = self
            .request(Method::GET, &format!("/projects/{uid}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let project: Project = self.check("get_list", response).await?.json().await?;
        Ok(Some(Self::to_list(project)))
    }

    async fn create_list(&self, name: &str) -> TodoResult<TaskList> {
        if let Some(existing) = self.get_list_by_name(name).await? {
            return Ok(existing);
        }
        let response = self
            .request(Method::POST, "/projects")
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        let project: Project = self.check("create_list", response).await?.json().await?;
        debug!(backend = %self.name, list = %project.id, "project created");
        Ok(Self::to_list(project))
    }

    async fn update_list(&self, list: &TaskList) -> TodoResult<TaskList> {
        let response = self
            .request(Method::POST, &format!("/projects/{}", list.uid))
            .json(&serde_json::json!({ "name": list.name }))
            .send()
            .await?;
        let project: Project = self.check("update_list", response).await?.json().await?;
        Ok(Self::to_list(project))
    }

    async fn delete_list(&self, uid: &str) -> TodoResult<()> {
        let response = self
            .request(Method::DELETE, &format!("/projects/{uid}"))
            .send()
            .await?;
        self.check("delete_list", response).await?;
        Ok(())
    }

    async fn get_tasks(&self, list_uid: &str) -> TodoResult<Vec<Task>> {
        let response = self
            .request(Method::GET, &format!("/tasks?project_id={list_uid}"))
            .send()
            .await?;
        let tasks: Vec<RemoteTask> = self.check("get_tasks", response).await?.json().await?;
        Ok(tasks.into_iter().map(|t| self.to_task(t)).collect())
    }

    async fn get_task(&self, _list_uid: &str, uid: &str) -> TodoResult<Option<Task>> {
        let response = self
            .request(Method::GET, &format!("/tasks/{uid}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let task: RemoteTask = self.check("get_task", response).await?.json().await?;
        Ok(Some(self.to_task(task)))
    }

    async fn create_task(&self, list_uid: &str, task: Task) -> TodoResult<Task> {
        let wants_completed = task.status == TaskStatus::Completed;
        let response = self
            .request(Method::POST, "/tasks")
            .json(&Self::payload(&task, Some(list_uid.to_string())))
            .send()
            .await?;
        let remote: RemoteTask = self.check("create_task", response).await?.json().await?;
        let mut created = self.to_task(remote);
        if wants_completed {
            self.set_completion(&created.uid, true).await?;
            created.set_status(TaskStatus::Completed, Utc::now());
        }
        Ok(created)
    }

    async fn update_task(&self, list_uid: &str, task: Task) -> TodoResult<Task> {
        let current = self
            .get_task(list_uid, &task.uid)
            .await?
            .ok_or_else(|| TodoError::NotFound {
                resource: format!("task {}", task.uid),
            })?;

        let response = self
            .request(Method::POST, &format!("/tasks/{}", task.uid))
            .json(&Self::payload(&task, None))
            .send()
            .await?;
        let remote: RemoteTask = self.check("update_task", response).await?.json().await?;
        let mut updated = self.to_task(remote);

        let want_completed = task.status == TaskStatus::Completed;
        if want_completed != (current.status == TaskStatus::Completed) {
            self.set_completion(&task.uid, want_completed).await?;
            updated.set_status(task.status, Utc::now());
        }
        Ok(updated)
    }

    async fn delete_task(&self, _list_uid: &str, uid: &str) -> TodoResult<()> {
        let response = self
            .request(Method::DELETE, &format!("/tasks/{uid}"))
            .send()
            .await?;
        self.check("delete_task", response).await?;
        Ok(())
    }

    async fn restore_list(&self, _uid: &str) -> TodoResult<TaskList> {
        Err(unsupported(&self.name, "restore_list"))
    }

    async fn purge_list(&self, _uid: &str) -> TodoResult<()> {
        Err(unsupported(&self.name, "purge_list"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_mapping_keeps_highest_highest() {
        assert_eq!(to_todoist_priority(1), 4);
        assert_eq!(to_todoist_priority(0), 1);
        assert_eq!(from_todoist_priority(4), 1);
        assert_eq!(from_todoist_priority(1), 0);
        // Round trip for the canonical levels.
        for ours in [0u8, 1, 2, 5] {
            let back = from_todoist_priority(to_todoist_priority(ours));
            assert_eq!(to_todoist_priority(back), to_todoist_priority(ours));
        }
    }
}
