//! CalDAV driver for Nextcloud-style servers.
//!
//! Lists are calendar collections under the configured home URL; tasks are
//! VTODO components fetched with a `calendar-query` REPORT and written back
//! as full `.ics` documents. Parsing uses the `ical` crate; the thin layer
//! of WebDAV XML around it is matched textually, which covers the
//! multistatus shapes the mainstream servers produce.

use std::io::BufReader;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use ical::parser::ical::component::IcalTodo;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Method, StatusCode};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::backends::{unsupported, CapabilitySet, TaskManager};
use crate::models::{Task, TaskList, TaskStatus};
use crate::utils::config::BackendConfig;
use crate::utils::error::{TodoError, TodoResult};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static RESPONSE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<[A-Za-z]*:?response[^>]*>(.*?)</[A-Za-z]*:?response>")
        .unwrap_or_else(|e| panic!("{e}"))
});
static HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<[A-Za-z]*:?href[^>]*>([^<]+)</[A-Za-z]*:?href>").unwrap_or_else(|e| panic!("{e}"))
});
static DISPLAYNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<[A-Za-z]*:?displayname[^>]*>([^<]*)</[A-Za-z]*:?displayname>")
        .unwrap_or_else(|e| panic!("{e}"))
});
static CALENDAR_DATA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<[A-Za-z]*:?calendar-data[^>]*>(.*?)</[A-Za-z]*:?calendar-data>")
        .unwrap_or_else(|e| panic!("{e}"))
});

const PROPFIND_CALENDARS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:displayname/>
    <d:resourcetype/>
    <c:supported-calendar-component-set/>
  </d:prop>
</d:propfind>"#;

const REPORT_TODOS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <c:calendar-data/>
  </d:prop>
  <c:filter>
    <c:comp-filter name="VCALENDAR">
      <c:comp-filter name="VTODO"/>
    </c:comp-filter>
  </c:filter>
</c:calendar-query>"#;

pub struct CaldavBackend {
    name: String,
    base: Url,
    username: String,
    password: Option<String>,
    client: Client,
}

impl CaldavBackend {
    pub fn new(name: &str, config: &BackendConfig, password: Option<String>) -> TodoResult<Self> {
        let url = config.url.as_deref().ok_or_else(|| TodoError::Configuration {
            reason: format!("backend {name}: caldav requires a url"),
        })?;
        let mut base = Url::parse(url).map_err(|e| TodoError::Configuration {
            reason: format!("backend {name}: invalid url: {e}"),
        })?;
        // Collection URLs must end with a slash for join() to nest.
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(TodoError::from)?;
        Ok(Self {
            name: name.to_string(),
            base,
            username: config.username.clone().unwrap_or_default(),
            password,
            client,
        })
    }

    fn dav(&self, method: &str, url: Url) -> reqwest::RequestBuilder {
        let method = Method::from_bytes(method.as_bytes()).unwrap_or(Method::GET);
        let builder = self.client.request(method, url);
        builder.basic_auth(&self.username, self.password.as_deref())
    }

    async fn check(
        &self,
        operation: &str,
        response: reqwest::Response,
    ) -> TodoResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TodoError::from_http_status(operation, status.as_u16(), &body))
    }

    fn calendar_url(&self, list_uid: &str) -> TodoResult<Url> {
        self.base
            .join(&format!("{list_uid}/"))
            .map_err(|e| TodoError::InvalidInput {
                field: "list_uid".to_string(),
                reason: e.to_string(),
            })
    }

    fn task_url(&self, list_uid: &str, uid: &str) -> TodoResult<Url> {
        self.calendar_url(list_uid)?
            .join(&format!("{uid}.ics"))
            .map_err(|e| TodoError::InvalidInput {
                field: "uid".to_string(),
                reason: e.to_string(),
            })
    }

    async fn fetch_calendars(&self) -> TodoResult<Vec<TaskList>> {
        let response = self
            .dav("PROPFIND", self.base.clone())
            .header("Depth", "1")
            .header("Content-Type", "application/xml")
            .body(PROPFIND_CALENDARS)
            .send()
            .await?;
        let body = self.check("get_lists", response).await?.text().await?;

        let mut lists = Vec::new();
        for block in RESPONSE_BLOCK.captures_iter(&body) {
            let block = &block[1];
            // Calendars that can hold todos; skip the home collection itself.
            if !block.contains("calendar") || !block.contains("VTODO") {
                continue;
            }
            let Some(href) = HREF.captures(block).map(|c| c[1].trim().to_string()) else {
                continue;
            };
            let uid = href
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or(&href)
                .to_string();
            if uid.is_empty() || href.trim_end_matches('/') == self.base.path().trim_end_matches('/')
            {
                continue;
            }
            let name = DISPLAYNAME
                .captures(block)
                .map_or_else(|| uid.clone(), |c| xml_unescape(&c[1]));
            lists.push(TaskList {
                uid,
                name,
                description: String::new(),
                color: String::new(),
                modified: Utc::now(),
                deleted_at: None,
            });
        }
        Ok(lists)
    }
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#13;", "\r")
        .replace("&amp;", "&")
}

fn format_dt(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

fn parse_ical_dt(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ") {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn prop<'a>(todo: &'a IcalTodo, name: &str) -> Option<&'a str> {
    todo.properties
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .and_then(|p| p.value.as_deref())
}

fn todo_to_task(todo: &IcalTodo, list_uid: &str) -> Option<Task> {
    let uid = prop(todo, "UID")?.to_string();
    let summary = ical_unescape(prop(todo, "SUMMARY").unwrap_or_default());
    if summary.is_empty() {
        return None;
    }
    let status = match prop(todo, "STATUS").unwrap_or("NEEDS-ACTION") {
        "COMPLETED" => TaskStatus::Completed,
        "IN-PROCESS" => TaskStatus::InProgress,
        "CANCELLED" => TaskStatus::Cancelled,
        _ => TaskStatus::NeedsAction,
    };
    let created = prop(todo, "CREATED")
        .and_then(parse_ical_dt)
        .unwrap_or_else(Utc::now);
    let modified = prop(todo, "LAST-MODIFIED")
        .or_else(|| prop(todo, "DTSTAMP"))
        .and_then(parse_ical_dt)
        .unwrap_or(created);
    let completed = prop(todo, "COMPLETED").and_then(parse_ical_dt);

    Some(Task {
        uid,
        list_uid: list_uid.to_string(),
        summary,
        description: ical_unescape(prop(todo, "DESCRIPTION").unwrap_or_default()),
        status,
        priority: prop(todo, "PRIORITY")
            .and_then(|p| p.parse::<u8>().ok())
            .map_or(0, |p| p.min(9)),
        due: prop(todo, "DUE").and_then(parse_ical_dt),
        start: prop(todo, "DTSTART").and_then(parse_ical_dt),
        completed: (status == TaskStatus::Completed)
            .then(|| completed.unwrap_or(modified)),
        categories: prop(todo, "CATEGORIES")
            .map(Task::categories_from_joined)
            .unwrap_or_default(),
        parent_uid: todo
            .properties
            .iter()
            .find(|p| {
                p.name.eq_ignore_ascii_case("RELATED-TO")
                    && p.params.as_ref().map_or(true, |params| {
                        params.iter().all(|(k, v)| {
                            !k.eq_ignore_ascii_case("RELTYPE")
                                || v.iter().any(|r| r == "PARENT")
                        })
                    })
            })
            .and_then(|p| p.value.clone()),
        created,
        modified,
        recurrence: prop(todo, "RRULE").map(str::to_string),
        local_id: None,
    })
}

fn ical_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace(',', "\\,")
        .replace(';', "\\;")
}

fn ical_unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(escaped) => out.push(escaped),
            None => out.push('\\'),
        }
    }
    out
}

fn task_to_vtodo(task: &Task) -> String {
    let mut lines = vec![
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".to_string(),
        "PRODID:-//todoat//caldav//EN".to_string(),
        "BEGIN:VTODO".to_string(),
        format!("UID:{}", task.uid),
        format!("DTSTAMP:{}", format_dt(Utc::now())),
        format!("CREATED:{}", format_dt(task.created)),
        format!("LAST-MODIFIED:{}", format_dt(task.modified)),
        format!("SUMMARY:{}", ical_escape(&task.summary)),
    ];
    if !task.description.is_empty() {
        lines.push(format!("DESCRIPTION:{}", ical_escape(&task.description)));
    }
    let status = match task.status {
        TaskStatus::NeedsAction => "NEEDS-ACTION",
        TaskStatus::InProgress => "IN-PROCESS",
        TaskStatus::Completed => "COMPLETED",
        TaskStatus::Cancelled => "CANCELLED",
    };
    lines.push(format!("STATUS:{status}"));
    if task.priority > 0 {
        lines.push(format!("PRIORITY:{}", task.priority));
    }
    if let Some(due) = task.due {
        lines.push(format!("DUE:{}", format_dt(due)));
    }
    if let Some(start) = task.start {
        lines.push(format!("DTSTART:{}", format_dt(start)));
    }
    if let Some(completed) = task.completed {
        lines.push(format!("COMPLETED:{}", format_dt(completed)));
    }
    if !task.categories.is_empty() {
        lines.push(format!("CATEGORIES:{}", task.categories_joined()));
    }
    if let Some(parent) = &task.parent_uid {
        lines.push(format!("RELATED-TO;RELTYPE=PARENT:{parent}"));
    }
    if let Some(rrule) = &task.recurrence {
        lines.push(format!("RRULE:{rrule}"));
    }
    lines.push("END:VTODO".to_string());
    lines.push("END:VCALENDAR".to_string());
    lines.join("\r\n") + "\r\n"
}

fn parse_vtodos(ics: &str) -> Vec<IcalTodo> {
    let reader = BufReader::new(ics.as_bytes());
    ical::IcalParser::new(reader)
        .filter_map(Result::ok)
        .flat_map(|calendar| calendar.todos)
        .collect()
}

#[async_trait]
impl TaskManager for CaldavBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            trash: false,
            priority: true,
            subtasks: true,
            categories: true,
            start_date: true,
            recurrence: true,
            sharing: true,
        }
    }

    async fn get_lists(&self) -> TodoResult<Vec<TaskList>> {
        self.fetch_calendars().await
    }

    async fn get_list(&self, uid: &str) -> TodoResult<Option<TaskList>> {
        Ok(self
            .fetch_calendars()
            .await?
            .into_iter()
            .find(|l| l.uid == uid))
    }

    async fn create_list(&self, name: &str) -> TodoResult<TaskList> {
        if let Some(existing) = self.get_list_by_name(name).await? {
            return Ok(existing);
        }
        let slug: String = name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect();
        let url = self.calendar_url(&slug)?;
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<c:mkcalendar xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:set><d:prop>
    <d:displayname>{name}</d:displayname>
    <c:supported-calendar-component-set><c:comp name="VTODO"/></c:supported-calendar-component-set>
  </d:prop></d:set>
</c:mkcalendar>"#
        );
        let response = self
            .dav("MKCALENDAR", url)
            .header("Content-Type", "application/xml")
            .body(body)
            .send()
            .await?;
        self.check("create_list", response).await?;
        debug!(backend = %self.name, list = slug, "calendar created");
        Ok(TaskList {
            uid: slug,
            name: name.to_string(),
            description: String::new(),
            color: String::new(),
            modified: Utc::now(),
            deleted_at: None,
        })
    }

    async fn update_list(&self, list: &TaskList) -> TodoResult<TaskList> {
        let url = self.calendar_url(&list.uid)?;
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<d:propertyupdate xmlns:d="DAV:">
  <d:set><d:prop><d:displayname>{}</d:displayname></d:prop></d:set>
</d:propertyupdate>"#,
            list.name
        );
        let response = self
            .dav("PROPPATCH", url)
            .header("Content-Type", "application/xml")
            .body(body)
            .send()
            .await?;
        self.check("update_list", response).await?;
        Ok(list.clone())
    }

    async fn delete_list(&self, uid: &str) -> TodoResult<()> {
        let response = self.dav("DELETE", self.calendar_url(uid)?).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(TodoError::NotFound {
                resource: format!("list {uid}"),
            });
        }
        self.check("delete_list", response).await?;
        Ok(())
    }

    async fn get_tasks(&self, list_uid: &str) -> TodoResult<Vec<Task>> {
        let response = self
            .dav("REPORT", self.calendar_url(list_uid)?)
            .header("Depth", "1")
            .header("Content-Type", "application/xml")
            .body(REPORT_TODOS)
            .send()
            .await?;
        let body = self.check("get_tasks", response).await?.text().await?;

        let mut tasks = Vec::new();
        for data in CALENDAR_DATA.captures_iter(&body) {
            let ics = xml_unescape(&data[1]);
            for todo in parse_vtodos(&ics) {
                if let Some(task) = todo_to_task(&todo, list_uid) {
                    tasks.push(task);
                }
            }
        }
        Ok(tasks)
    }

    async fn get_task(&self, list_uid: &str, uid: &str) -> TodoResult<Option<Task>> {
        let response = self.dav("GET", self.task_url(list_uid, uid)?).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let ics = self.check("get_task", response).await?.text().await?;
        Ok(parse_vtodos(&ics)
            .first()
            .and_then(|todo| todo_to_task(todo, list_uid)))
    }

    async fn create_task(&self, list_uid: &str, task: Task) -> TodoResult<Task> {
        let now = Utc::now();
        let mut created = task;
        created.uid = Uuid::new_v4().to_string();
        created.list_uid = list_uid.to_string();
        created.created = now;
        created.modified = now;
        created.validate()?;

        let response = self
            .dav("PUT", self.task_url(list_uid, &created.uid)?)
            .header("Content-Type", "text/calendar; charset=utf-8")
            // Create-only: a UID collision must not overwrite.
            .header("If-None-Match", "*")
            .body(task_to_vtodo(&created))
            .send()
            .await?;
        self.check("create_task", response).await?;
        Ok(created)
    }

    async fn update_task(&self, list_uid: &str, task: Task) -> TodoResult<Task> {
        task.validate()?;
        if self.get_task(list_uid, &task.uid).await?.is_none() {
            return Err(TodoError::NotFound {
                resource: format!("task {}", task.uid),
            });
        }
        let mut updated = task;
        updated.modified = Utc::now();
        let response = self
            .dav("PUT", self.task_url(list_uid, &updated.uid)?)
            .header("Content-Type", "text/calendar; charset=utf-8")
            .body(task_to_vtodo(&updated))
            .send()
            .await?;
        self.check("update_task", response).await?;
        Ok(updated)
    }

    async fn delete_task(&self, list_uid: &str, uid: &str) -> TodoResult<()> {
        let response = self.dav("DELETE", self.task_url(list_uid, uid)?).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(TodoError::NotFound {
                resource: format!("task {uid}"),
            });
        }
        self.check("delete_task", response).await?;
        Ok(())
    }

    async fn restore_list(&self, _uid: &str) -> TodoResult<TaskList> {
        Err(unsupported(&self.name, "restore_list"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vtodo_round_trip_preserves_fields() {
        let mut task = Task::new("personal", "Water the plants").with_priority(3);
        task.uid = "abc-123".to_string();
        task.description = "back garden, both beds".to_string();
        task.categories = vec!["garden".to_string()];
        task.start = Some(parse_ical_dt("20260110T080000Z").unwrap());
        task.due = Some(parse_ical_dt("20260112T080000Z").unwrap());
        task.recurrence = Some("FREQ=WEEKLY".to_string());

        let ics = task_to_vtodo(&task);
        let todos = parse_vtodos(&ics);
        assert_eq!(todos.len(), 1);
        let parsed = todo_to_task(&todos[0], "personal").unwrap();

        assert_eq!(parsed.uid, "abc-123");
        assert_eq!(parsed.summary, "Water the plants");
        assert_eq!(parsed.description, "back garden, both beds");
        assert_eq!(parsed.priority, 3);
        assert_eq!(parsed.categories, vec!["garden"]);
        assert_eq!(parsed.due, task.due);
        assert_eq!(parsed.start, task.start);
        assert_eq!(parsed.recurrence.as_deref(), Some("FREQ=WEEKLY"));
        assert_eq!(parsed.status, TaskStatus::NeedsAction);
    }

    #[test]
    fn completed_vtodo_carries_timestamp() {
        let mut task = Task::new("personal", "Done thing");
        task.uid = "done-1".to_string();
        task.set_status(TaskStatus::Completed, Utc::now());

        let parsed = todo_to_task(&parse_vtodos(&task_to_vtodo(&task))[0], "personal").unwrap();
        assert_eq!(parsed.status, TaskStatus::Completed);
        assert!(parsed.completed.is_some());
    }

    #[test]
    fn parent_link_round_trips_via_related_to() {
        let mut task = Task::new("personal", "Child").with_parent("parent-uid");
        task.uid = "child-uid".to_string();
        let parsed = todo_to_task(&parse_vtodos(&task_to_vtodo(&task))[0], "personal").unwrap();
        assert_eq!(parsed.parent_uid.as_deref(), Some("parent-uid"));
    }

    #[test]
    fn text_escaping_round_trips() {
        let raw = "a, b; c\\d\nnewline";
        assert_eq!(ical_unescape(&ical_escape(raw)), raw);
    }

    #[test]
    fn ical_datetime_formats() {
        assert!(parse_ical_dt("20260120T120000Z").is_some());
        assert!(parse_ical_dt("20260120T120000").is_some());
        assert!(parse_ical_dt("20260120").is_some());
        assert!(parse_ical_dt("next tuesday").is_none());
    }

    #[test]
    fn multistatus_calendar_extraction() {
        let body = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:response>
    <d:href>/dav/calendars/me/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/calendars/me/tasks/</d:href>
    <d:propstat><d:prop>
      <d:displayname>My Tasks</d:displayname>
      <d:resourcetype><d:collection/><c:calendar/></d:resourcetype>
      <c:supported-calendar-component-set><c:comp name="VTODO"/></c:supported-calendar-component-set>
    </d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;

        let blocks: Vec<_> = RESPONSE_BLOCK.captures_iter(body).collect();
        assert_eq!(blocks.len(), 2);
        // Only the VTODO-capable calendar collection qualifies.
        let eligible: Vec<_> = blocks
            .iter()
            .filter(|b| b[1].contains("calendar") && b[1].contains("VTODO"))
            .collect();
        assert_eq!(eligible.len(), 1);
        assert_eq!(&HREF.captures(&eligible[0][1]).unwrap()[1], "/dav/calendars/me/tasks/");
    }
}
