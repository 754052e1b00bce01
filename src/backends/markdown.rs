//! Markdown file backend.
//!
//! A file is an eligible task store when it contains the marker comment
//! anywhere in its content. `##` headings denote lists, checkbox items
//! denote tasks, two-space indentation nests subtasks, and inline `!N`,
//! `@YYYY-MM-DD` and `#tag` tokens carry priority, due date and categories.
//! Saving and reloading a file is a fixed point.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backends::{CapabilitySet, TaskManager};
use crate::models::{Task, TaskList, TaskStatus};
use crate::utils::config::BackendConfig;
use crate::utils::error::{TodoError, TodoResult};

/// Token that makes a Markdown file an eligible task store.
pub const MARKER: &str = "<!-- todoat -->";

const DEFAULT_NAMES: [&str; 3] = ["TODO.md", "todo.md", ".todoat.md"];

static TASK_LINE: Lazy<Regex> = Lazy::new(|| {
    // capture: indent, status char, text
    Regex::new(r"^(\s*)- \[([ x~-])\] (.*)$").unwrap_or_else(|e| panic!("task regex: {e}"))
});
static PRIORITY_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)!([1-9])(?:\s|$)").unwrap_or_else(|e| panic!("{e}")));
static DUE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)@(\d{4}-\d{2}-\d{2})(?:\s|$)").unwrap_or_else(|e| panic!("{e}")));
static TAG_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)#([A-Za-z0-9_-]+)").unwrap_or_else(|e| panic!("{e}")));

/// Parsed file: lists in order, tasks in order within each list.
#[derive(Debug, Clone, Default, PartialEq)]
struct Document {
    lists: Vec<(TaskList, Vec<Task>)>,
}

pub struct MarkdownBackend {
    name: String,
    file_path: PathBuf,
    git: bool,
    detected: bool,
    /// Serialises load-modify-save cycles.
    lock: Arc<Mutex<()>>,
}

impl MarkdownBackend {
    pub fn open(name: &str, config: &BackendConfig) -> TodoResult<Self> {
        let (file_path, detected) = resolve_file(config)?;
        debug!(backend = name, path = %file_path.display(), detected, "markdown backend opened");
        Ok(Self {
            name: name.to_string(),
            file_path,
            git: config.git,
            detected,
            lock: Arc::new(Mutex::new(())),
        })
    }

    fn load(&self) -> TodoResult<Document> {
        if !self.file_path.exists() {
            return Ok(Document::default());
        }
        let content = std::fs::read_to_string(&self.file_path)?;
        if !content.contains(MARKER) {
            return Err(TodoError::Configuration {
                reason: format!(
                    "{} exists but lacks the {MARKER} marker",
                    self.file_path.display()
                ),
            });
        }
        let mtime = file_mtime(&self.file_path);
        Ok(parse_document(&content, mtime))
    }

    fn save(&self, doc: &Document) -> TodoResult<()> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.file_path, render_document(doc))?;
        if self.git {
            self.git_commit();
        }
        Ok(())
    }

    /// Best-effort commit when the file lives in a git work tree.
    fn git_commit(&self) {
        let Some(dir) = self.file_path.parent() else {
            return;
        };
        if !dir.join(".git").exists() {
            return;
        }
        let add = Command::new("git")
            .arg("-C")
            .arg(dir)
            .arg("add")
            .arg(&self.file_path)
            .status();
        let committed = add.and_then(|_| {
            Command::new("git")
                .arg("-C")
                .arg(dir)
                .args(["commit", "-m", "todoat: update tasks", "--quiet"])
                .status()
        });
        if let Err(e) = committed {
            warn!(backend = %self.name, error = %e, "git commit skipped");
        }
    }

    fn find_list<'a>(
        doc: &'a mut Document,
        uid: &str,
    ) -> Option<&'a mut (TaskList, Vec<Task>)> {
        doc.lists.iter_mut().find(|(l, _)| l.uid == uid)
    }
}

/// Reject parent links a render could not express: unknown parents and
/// chains that loop back onto the task itself. `render_document`'s nested
/// emit recurses over the parent forest, so a cycle here must never reach
/// the file.
fn check_parent(tasks: &[Task], task: &Task) -> TodoResult<()> {
    let Some(parent_uid) = &task.parent_uid else {
        return Ok(());
    };
    if parent_uid == &task.uid {
        return Err(TodoError::InvalidInput {
            field: "parent_uid".to_string(),
            reason: "task cannot be its own parent".to_string(),
        });
    }
    let mut current = parent_uid.as_str();
    // Bounded walk: a forest deeper than this is a loop in practice.
    for _ in 0..64 {
        let Some(parent) = tasks.iter().find(|t| t.uid == current) else {
            return Err(TodoError::InvalidInput {
                field: "parent_uid".to_string(),
                reason: format!("parent {current} not found in list"),
            });
        };
        match &parent.parent_uid {
            Some(next) if next == &task.uid => {
                return Err(TodoError::InvalidInput {
                    field: "parent_uid".to_string(),
                    reason: "task cannot be its own ancestor".to_string(),
                });
            }
            Some(next) => current = next,
            None => return Ok(()),
        }
    }
    Err(TodoError::InvalidInput {
        field: "parent_uid".to_string(),
        reason: "parent chain too deep".to_string(),
    })
}

fn resolve_file(config: &BackendConfig) -> TodoResult<(PathBuf, bool)> {
    // Explicit path first: a file as-is, a directory searched inside.
    let mut candidates: Vec<PathBuf> = Vec::new();
    let base_dir = match &config.path {
        Some(p) if p.is_dir() => {
            for fallback in &config.fallbacks {
                candidates.push(p.join(fallback));
            }
            for name in DEFAULT_NAMES {
                candidates.push(p.join(name));
            }
            p.clone()
        }
        Some(p) => {
            candidates.push(p.clone());
            p.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        }
        None => {
            let cwd = std::env::current_dir()?;
            for fallback in &config.fallbacks {
                candidates.push(cwd.join(fallback));
            }
            for name in DEFAULT_NAMES {
                candidates.push(cwd.join(name));
            }
            cwd
        }
    };

    for candidate in &candidates {
        if candidate.is_file() {
            let content = std::fs::read_to_string(candidate)?;
            if content.contains(MARKER) {
                return Ok((candidate.clone(), true));
            }
        }
    }

    // Nothing eligible yet: first write will create the preferred name.
    let fresh = match &config.path {
        Some(p) if !p.is_dir() => p.clone(),
        _ => base_dir.join(DEFAULT_NAMES[0]),
    };
    Ok((fresh, false))
}

fn file_mtime(path: &Path) -> DateTime<Utc> {
    path.metadata()
        .and_then(|m| m.modified())
        .map_or_else(|_| Utc::now(), DateTime::from)
}

fn list_uid(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    format!("list-{slug}")
}

fn status_char(status: TaskStatus) -> char {
    match status {
        TaskStatus::NeedsAction => ' ',
        TaskStatus::Completed => 'x',
        TaskStatus::InProgress => '~',
        TaskStatus::Cancelled => '-',
    }
}

fn status_from_char(c: char) -> TaskStatus {
    match c {
        'x' => TaskStatus::Completed,
        '~' => TaskStatus::InProgress,
        '-' => TaskStatus::Cancelled,
        _ => TaskStatus::NeedsAction,
    }
}

/// Split inline metadata tokens out of the raw item text.
fn parse_item_text(text: &str) -> (String, u8, Option<DateTime<Utc>>, Vec<String>) {
    let mut priority = 0u8;
    let mut due = None;
    let mut categories = Vec::new();

    if let Some(cap) = PRIORITY_TOKEN.captures(text) {
        priority = cap[1].parse().unwrap_or(0);
    }
    if let Some(cap) = DUE_TOKEN.captures(text) {
        if let Ok(date) = NaiveDate::parse_from_str(&cap[1], "%Y-%m-%d") {
            due = date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    for cap in TAG_TOKEN.captures_iter(text) {
        categories.push(cap[1].to_string());
    }

    let mut summary = text.to_string();
    summary = PRIORITY_TOKEN.replace_all(&summary, " ").to_string();
    summary = DUE_TOKEN.replace_all(&summary, " ").to_string();
    summary = TAG_TOKEN.replace_all(&summary, "").to_string();
    let summary = summary.split_whitespace().collect::<Vec<_>>().join(" ");

    (summary, priority, due, categories)
}

fn render_item_text(task: &Task) -> String {
    let mut text = task.summary.clone();
    if task.priority > 0 {
        text.push_str(&format!(" !{}", task.priority));
    }
    if let Some(due) = task.due {
        text.push_str(&format!(" @{}", due.format("%Y-%m-%d")));
    }
    for tag in &task.categories {
        text.push_str(&format!(" #{tag}"));
    }
    text
}

fn parse_document(content: &str, mtime: DateTime<Utc>) -> Document {
    let mut doc = Document::default();
    // Stack of (indent level, uid) for parent resolution.
    let mut parents: Vec<(usize, String)> = Vec::new();
    let mut counter = 0usize;

    for line in content.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            let name = heading.trim().to_string();
            let list = TaskList {
                uid: list_uid(&name),
                name,
                description: String::new(),
                color: String::new(),
                modified: mtime,
                deleted_at: None,
            };
            doc.lists.push((list, Vec::new()));
            parents.clear();
            continue;
        }

        let Some(cap) = TASK_LINE.captures(line) else {
            continue;
        };
        let Some((list, tasks)) = doc.lists.last_mut() else {
            continue; // item before any heading
        };

        let depth = cap[1].len() / 2;
        let status = status_from_char(cap[2].chars().next().unwrap_or(' '));
        let (summary, priority, due, categories) = parse_item_text(&cap[3]);
        if summary.is_empty() {
            continue;
        }

        parents.truncate(depth);
        counter += 1;
        let uid = format!("{}-{counter}", list.uid);
        let task = Task {
            uid: uid.clone(),
            list_uid: list.uid.clone(),
            summary,
            description: String::new(),
            status,
            priority,
            due,
            start: None,
            completed: (status == TaskStatus::Completed).then_some(mtime),
            categories,
            parent_uid: parents.last().map(|(_, p)| p.clone()),
            created: mtime,
            modified: mtime,
            recurrence: None,
            local_id: Some(counter as i64),
        };
        parents.push((depth + 1, uid));
        tasks.push(task);
    }
    doc
}

fn render_document(doc: &Document) -> String {
    let mut out = String::new();
    out.push_str(MARKER);
    out.push('\n');

    for (list, tasks) in &doc.lists {
        out.push('\n');
        out.push_str("## ");
        out.push_str(&list.name);
        out.push('\n');

        // Emit roots in order, children under their parent.
        fn emit(out: &mut String, tasks: &[Task], parent: Option<&str>, depth: usize) {
            for task in tasks
                .iter()
                .filter(|t| t.parent_uid.as_deref() == parent)
            {
                out.push_str(&"  ".repeat(depth));
                out.push_str("- [");
                out.push(status_char(task.status));
                out.push_str("] ");
                out.push_str(&render_item_text(task));
                out.push('\n');
                emit(out, tasks, Some(&task.uid), depth + 1);
            }
        }
        emit(&mut out, tasks, None, 0);
    }
    out
}

#[async_trait]
impl TaskManager for MarkdownBackend {
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
            sharing: false,
        }
    }

    async fn get_lists(&self) -> TodoResult<Vec<TaskList>> {
        let _guard = self.lock.lock().await;
        Ok(self.load()?.lists.into_iter().map(|(l, _)| l).collect())
    }

    async fn get_list(&self, uid: &str) -> TodoResult<Option<TaskList>> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()?
            .lists
            .into_iter()
            .map(|(l, _)| l)
            .find(|l| l.uid == uid))
    }

    async fn create_list(&self, name: &str) -> TodoResult<TaskList> {
        if name.trim().is_empty() {
            return Err(TodoError::InvalidInput {
                field: "name".to_string(),
                reason: "list name must not be empty".to_string(),
            });
        }
        let _guard = self.lock.lock().await;
        let mut doc = self.load()?;
        if let Some((existing, _)) = doc.lists.iter().find(|(l, _)| l.name_matches(name)) {
            return Ok(existing.clone());
        }
        let list = TaskList {
            uid: list_uid(name),
            name: name.to_string(),
            description: String::new(),
            color: String::new(),
            modified: Utc::now(),
            deleted_at: None,
        };
        doc.lists.push((list.clone(), Vec::new()));
        self.save(&doc)?;
        Ok(list)
    }

    async fn update_list(&self, list: &TaskList) -> TodoResult<TaskList> {
        list.validate()?;
        let _guard = self.lock.lock().await;
        let mut doc = self.load()?;
        let entry = Self::find_list(&mut doc, &list.uid).ok_or_else(|| TodoError::NotFound {
            resource: format!("list {}", list.uid),
        })?;
        entry.0.name = list.name.clone();
        let renamed = entry.0.clone();
        self.save(&doc)?;
        Ok(renamed)
    }

    async fn delete_list(&self, uid: &str) -> TodoResult<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load()?;
        let before = doc.lists.len();
        doc.lists.retain(|(l, _)| l.uid != uid);
        if doc.lists.len() == before {
            return Err(TodoError::NotFound {
                resource: format!("list {uid}"),
            });
        }
        self.save(&doc)
    }

    async fn get_tasks(&self, list_uid: &str) -> TodoResult<Vec<Task>> {
        let _guard = self.lock.lock().await;
        let doc = self.load()?;
        Ok(doc
            .lists
            .into_iter()
            .find(|(l, _)| l.uid == list_uid)
            .map(|(_, tasks)| tasks)
            .unwrap_or_default())
    }

    async fn get_task(&self, list_uid: &str, uid: &str) -> TodoResult<Option<Task>> {
        Ok(self
            .get_tasks(list_uid)
            .await?
            .into_iter()
            .find(|t| t.uid == uid))
    }

    async fn create_task(&self, list_uid: &str, task: Task) -> TodoResult<Task> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load()?;
        let entry = Self::find_list(&mut doc, list_uid).ok_or_else(|| TodoError::NotFound {
            resource: format!("list {list_uid}"),
        })?;

        check_parent(&entry.1, &task)?;

        // Next free numeric suffix; len() alone could collide after deletes.
        let next = entry
            .1
            .iter()
            .filter_map(|t| t.uid.rsplit('-').next()?.parse::<usize>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        let now = Utc::now();
        let mut created = task;
        created.uid = format!("{list_uid}-{next}");
        created.list_uid = list_uid.to_string();
        created.created = now;
        created.modified = now;
        created.validate()?;
        entry.1.push(created.clone());
        self.save(&doc)?;
        Ok(created)
    }

    async fn update_task(&self, list_uid: &str, task: Task) -> TodoResult<Task> {
        task.validate()?;
        let _guard = self.lock.lock().await;
        let mut doc = self.load()?;
        let entry = Self::find_list(&mut doc, list_uid).ok_or_else(|| TodoError::NotFound {
            resource: format!("list {list_uid}"),
        })?;
        check_parent(&entry.1, &task)?;
        let slot = entry
            .1
            .iter_mut()
            .find(|t| t.uid == task.uid)
            .ok_or_else(|| TodoError::NotFound {
                resource: format!("task {}", task.uid),
            })?;
        let mut updated = task;
        updated.modified = Utc::now();
        *slot = updated.clone();
        self.save(&doc)?;
        Ok(updated)
    }

    async fn delete_task(&self, list_uid: &str, uid: &str) -> TodoResult<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load()?;
        let entry = Self::find_list(&mut doc, list_uid).ok_or_else(|| TodoError::NotFound {
            resource: format!("list {list_uid}"),
        })?;
        let before = entry.1.len();
        // Orphaned children become roots.
        for t in entry.1.iter_mut() {
            if t.parent_uid.as_deref() == Some(uid) {
                t.parent_uid = None;
            }
        }
        entry.1.retain(|t| t.uid != uid);
        if entry.1.len() == before {
            return Err(TodoError::NotFound {
                resource: format!("task {uid}"),
            });
        }
        self.save(&doc)
    }

    fn can_detect(&self) -> bool {
        self.detected
    }

    fn detection_info(&self) -> String {
        format!("markdown task file at {}", self.file_path.display())
    }
}
