//! Todoist driver against a mocked HTTP server: payload mapping and the
//! HTTP-status-to-error-kind table.

use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use todoat::backends::todoist::TodoistBackend;
use todoat::backends::TaskManager;
use todoat::models::{Task, TaskStatus};
use todoat::utils::error::TodoError;

fn driver(server: &MockServer) -> TodoistBackend {
    TodoistBackend::with_base_url("todoist", "token-123".to_string(), &server.uri()).unwrap()
}

#[tokio::test]
async fn lists_map_projects_and_carry_the_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .and(header("authorization", "Bearer token-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "p1", "name": "Inbox", "color": "grey" },
            { "id": "p2", "name": "Work", "color": "blue" }
        ])))
        .mount(&server)
        .await;

    let lists = driver(&server).get_lists().await.unwrap();
    assert_eq!(lists.len(), 2);
    assert_eq!(lists[0].uid, "p1");
    assert_eq!(lists[1].name, "Work");
    assert_eq!(lists[1].color, "blue");
}

#[tokio::test]
async fn tasks_map_fields_and_priorities() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tasks"))
        .and(query_param("project_id", "p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": "t1",
            "project_id": "p1",
            "content": "Buy milk",
            "description": "two litres",
            "priority": 4,
            "labels": ["errands"],
            "parent_id": null,
            "due": { "date": "2026-01-20" },
            "is_completed": false,
            "created_at": "2026-01-10T08:00:00Z",
            "updated_at": "2026-01-11T09:30:00Z"
        }])))
        .mount(&server)
        .await;

    let tasks = driver(&server).get_tasks("p1").await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.uid, "t1");
    assert_eq!(task.summary, "Buy milk");
    // Todoist urgent (4) is our highest (1).
    assert_eq!(task.priority, 1);
    assert_eq!(task.categories, vec!["errands"]);
    assert_eq!(task.status, TaskStatus::NeedsAction);
    assert_eq!(
        task.due.map(|d| d.format("%Y-%m-%d").to_string()),
        Some("2026-01-20".to_string())
    );
    assert!(task.modified > task.created);
}

#[tokio::test]
async fn create_task_posts_payload_and_adopts_the_remote_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "t99",
            "project_id": "p1",
            "content": "New task",
            "description": "",
            "priority": 1,
            "labels": [],
            "parent_id": null,
            "due": null,
            "is_completed": false,
            "created_at": "2026-01-10T08:00:00Z",
            "updated_at": null
        })))
        .mount(&server)
        .await;

    let task = Task::new("p1", "New task");
    let created = driver(&server).create_task("p1", task).await.unwrap();
    assert_eq!(created.uid, "t99");
    assert!(!created.has_placeholder_uid());
}

#[tokio::test]
async fn http_statuses_map_to_the_error_taxonomy() {
    let server = MockServer::start().await;
    for (status, expect_transient) in [(429u16, true), (503, true), (500, true)] {
        let _guard = Mock::given(method("GET"))
            .and(path("/projects"))
            .respond_with(ResponseTemplate::new(status))
            .expect(1)
            .mount_as_scoped(&server)
            .await;
        let err = driver(&server).get_lists().await.unwrap_err();
        assert_eq!(err.is_transient(), expect_transient, "status {status}");
    }

    {
        let _guard = Mock::given(method("GET"))
            .and(path("/projects"))
            .respond_with(ResponseTemplate::new(401))
            .mount_as_scoped(&server)
            .await;
        assert!(matches!(
            driver(&server).get_lists().await.unwrap_err(),
            TodoError::Auth { .. }
        ));
    }

    {
        let _guard = Mock::given(method("GET"))
            .and(path("/projects"))
            .respond_with(ResponseTemplate::new(400))
            .mount_as_scoped(&server)
            .await;
        assert!(matches!(
            driver(&server).get_lists().await.unwrap_err(),
            TodoError::PermanentIo { .. }
        ));
    }
}

#[tokio::test]
async fn missing_task_reads_as_none_not_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tasks/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let found = driver(&server).get_task("p1", "gone").await.unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn create_list_is_idempotent_on_existing_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "p1", "name": "Inbox", "color": "" }
        ])))
        .mount(&server)
        .await;
    // No POST expectation: the existing project must be returned directly.

    let list = driver(&server).create_list("inbox").await.unwrap();
    assert_eq!(list.uid, "p1");
}
