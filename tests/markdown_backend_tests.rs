//! The Markdown backend end to end: eligibility by marker, the documented
//! file conventions, and save/reload as a fixed point.

use todoat::backends::markdown::{MarkdownBackend, MARKER};
use todoat::backends::TaskManager;
use todoat::models::TaskStatus;
use todoat::utils::config::BackendConfig;

fn backend_for(dir: &std::path::Path) -> MarkdownBackend {
    let config = BackendConfig {
        kind: "markdown".to_string(),
        path: Some(dir.to_path_buf()),
        ..BackendConfig::default()
    };
    MarkdownBackend::open("notes", &config).unwrap()
}

/// S6: a repo with a marked TODO.md, one list, parent and indented child.
#[tokio::test]
async fn loads_list_with_parent_link_and_roundtrips() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("TODO.md"),
        format!("{MARKER}\n\n## Work\n- [ ] Parent\n  - [~] Child\n"),
    )
    .unwrap();

    let backend = backend_for(dir.path());
    assert!(backend.can_detect());

    let lists = backend.get_lists().await.unwrap();
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].name, "Work");

    let tasks = backend.get_tasks(&lists[0].uid).await.unwrap();
    assert_eq!(tasks.len(), 2);
    let parent = tasks.iter().find(|t| t.summary == "Parent").unwrap();
    let child = tasks.iter().find(|t| t.summary == "Child").unwrap();
    assert_eq!(child.parent_uid.as_deref(), Some(parent.uid.as_str()));
    assert_eq!(child.status, TaskStatus::InProgress);

    // Saving and reloading is a fixed point.
    let reloaded = backend.update_task(&lists[0].uid, parent.clone()).await.unwrap();
    assert_eq!(reloaded.summary, "Parent");
    let content = std::fs::read_to_string(dir.path().join("TODO.md")).unwrap();
    assert!(content.contains("## Work"));
    assert!(content.contains("- [ ] Parent"));
    assert!(content.contains("  - [~] Child"));

    let again = backend.get_tasks(&lists[0].uid).await.unwrap();
    assert_eq!(again.len(), 2);
    assert_eq!(
        again.iter().find(|t| t.summary == "Child").unwrap().status,
        TaskStatus::InProgress
    );
}

#[tokio::test]
async fn search_order_prefers_configured_fallbacks() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("tasks.md"),
        format!("{MARKER}\n## Planned\n- [ ] Something\n"),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("TODO.md"),
        format!("{MARKER}\n## Default\n- [ ] Other\n"),
    )
    .unwrap();

    let config = BackendConfig {
        kind: "markdown".to_string(),
        path: Some(dir.path().to_path_buf()),
        fallbacks: vec!["tasks.md".to_string()],
        ..BackendConfig::default()
    };
    let backend = MarkdownBackend::open("notes", &config).unwrap();
    let lists = backend.get_lists().await.unwrap();
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].name, "Planned");
}

#[tokio::test]
async fn inline_metadata_is_parsed_and_rendered() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("TODO.md"),
        format!("{MARKER}\n## Inbox\n- [ ] Pay rent !1 @2026-02-01 #finance\n"),
    )
    .unwrap();

    let backend = backend_for(dir.path());
    let lists = backend.get_lists().await.unwrap();
    let tasks = backend.get_tasks(&lists[0].uid).await.unwrap();
    let task = &tasks[0];
    assert_eq!(task.summary, "Pay rent");
    assert_eq!(task.priority, 1);
    assert_eq!(task.categories, vec!["finance"]);

    // A write keeps the inline metadata in the file.
    backend.update_task(&lists[0].uid, task.clone()).await.unwrap();
    let content = std::fs::read_to_string(dir.path().join("TODO.md")).unwrap();
    assert!(content.contains("- [ ] Pay rent !1 @2026-02-01 #finance"));
}

#[tokio::test]
async fn files_without_marker_are_not_task_stores() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("TODO.md"), "# Notes\n- [ ] not ours\n").unwrap();

    let backend = backend_for(dir.path());
    assert!(!backend.can_detect());
    assert!(backend.get_lists().await.is_err());
}
