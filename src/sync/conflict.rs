//! Conflict resolution policies.
//!
//! A conflict is a (local, remote) pair for one UID where both sides moved
//! past the last-sync baseline. Resolution is a pure computation here; the
//! engine applies the outcome to the cache and the queue. A conflict is
//! never silently dropped: every record gets a terminal resolution.

use chrono::Utc;
use uuid::Uuid;

use crate::models::{ConflictRecord, ConflictResolution, Task};

/// Suffix appended to the duplicated task under `keep_both`.
pub const KEEP_BOTH_SUFFIX: &str = " (conflicted copy)";

/// What the engine must do to apply a resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub resolution: ConflictResolution,
    /// New cache content for the UID; `None` removes the row.
    pub cache_task: Option<Task>,
    /// Whether `cache_task` came from the remote (baseline update) rather
    /// than surviving local state (which still needs pushing).
    pub cache_is_remote: bool,
    /// Push to enqueue, if the local side survives in some form.
    pub push: Option<PushAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushAction {
    /// Push the surviving local state as a full update.
    Update(Task),
    /// Re-create remotely (remote side was deleted, or keep-both copy).
    Create(Task),
}

/// Apply `policy` to one conflict. `base` is the snapshot from the last
/// successful sync when the cache still has it; merge degrades to
/// local-wins-per-field without it.
#[must_use]
pub fn resolve(
    policy: ConflictResolution,
    conflict: &ConflictRecord,
    base: Option<&Task>,
) -> ResolutionOutcome {
    match (policy, &conflict.remote) {
        (ConflictResolution::ServerWins, Some(remote)) => ResolutionOutcome {
            resolution: policy,
            cache_task: Some(remote.clone()),
            cache_is_remote: true,
            push: None,
        },
        (ConflictResolution::ServerWins, None) => ResolutionOutcome {
            // Remote deleted it; the local edit is discarded.
            resolution: policy,
            cache_task: None,
            cache_is_remote: true,
            push: None,
        },
        (ConflictResolution::LocalWins, Some(_)) => ResolutionOutcome {
            resolution: policy,
            cache_task: Some(conflict.local.clone()),
            cache_is_remote: false,
            push: Some(PushAction::Update(conflict.local.clone())),
        },
        (ConflictResolution::LocalWins | ConflictResolution::Merge | ConflictResolution::KeepBoth, None) => {
            // Deleted remotely while edited locally: recreate from local.
            ResolutionOutcome {
                resolution: policy,
                cache_task: Some(conflict.local.clone()),
                cache_is_remote: false,
                push: Some(PushAction::Create(conflict.local.clone())),
            }
        }
        (ConflictResolution::Merge, Some(remote)) => {
            let merged = merge_tasks(&conflict.local, remote, base);
            ResolutionOutcome {
                resolution: policy,
                cache_task: Some(merged.clone()),
                cache_is_remote: false,
                push: Some(PushAction::Update(merged)),
            }
        }
        (ConflictResolution::KeepBoth, Some(remote)) => {
            // Remote version keeps the UID; the local edit becomes a new
            // task pushed alongside it.
            let mut copy = conflict.local.clone();
            copy.uid = format!("local-{}", Uuid::new_v4());
            copy.summary.push_str(KEEP_BOTH_SUFFIX);
            copy.created = Utc::now();
            copy.modified = copy.created;
            ResolutionOutcome {
                resolution: policy,
                cache_task: Some(remote.clone()),
                cache_is_remote: true,
                push: Some(PushAction::Create(copy)),
            }
        }
    }
}

/// Field-by-field three-way merge. A field differing between the sides
/// takes whichever side changed it relative to `base`; when both changed
/// it (or the base is gone) the local side wins. Categories take the set
/// union.
fn merge_tasks(local: &Task, remote: &Task, base: Option<&Task>) -> Task {
    macro_rules! pick {
        ($field:ident) => {
            pick_field(
                &local.$field,
                &remote.$field,
                base.map(|b| &b.$field),
            )
            .clone()
        };
    }

    let mut merged = local.clone();
    merged.summary = pick!(summary);
    merged.description = pick!(description);
    merged.status = *pick_field(&local.status, &remote.status, base.map(|b| &b.status));
    merged.priority = *pick_field(&local.priority, &remote.priority, base.map(|b| &b.priority));
    merged.due = pick!(due);
    merged.start = pick!(start);
    merged.completed = pick!(completed);
    merged.parent_uid = pick!(parent_uid);
    merged.recurrence = pick!(recurrence);

    // Categories: union, local order first.
    let mut categories = local.categories.clone();
    for category in &remote.categories {
        if !categories.contains(category) {
            categories.push(category.clone());
        }
    }
    merged.categories = categories;

    // The merged entity is a fresh edit on top of both.
    merged.modified = local.modified.max(remote.modified).max(merged.modified);
    // Keep the completed-timestamp invariant whatever the field mix was.
    if merged.status == crate::models::TaskStatus::Completed {
        if merged.completed.is_none() {
            merged.completed = Some(merged.modified);
        }
    } else {
        merged.completed = None;
    }
    merged
}

fn pick_field<'a, T: PartialEq>(local: &'a T, remote: &'a T, base: Option<&'a T>) -> &'a T {
    if local == remote {
        return local;
    }
    match base {
        Some(base) => {
            let local_changed = local != base;
            let remote_changed = remote != base;
            match (local_changed, remote_changed) {
                (false, true) => remote,
                // Both changed: fall back to local_wins.
                _ => local,
            }
        }
        // No ancestor to consult: local wins.
        None => local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use chrono::Utc;

    fn conflict_pair() -> (Task, Task, Task) {
        // base -> local changes priority, remote changes summary
        let mut base = Task::new("list-1", "Original");
        base.uid = "uid-1".to_string();
        base.priority = 1;

        let mut local = base.clone();
        local.priority = 2;
        local.touch(Utc::now());

        let mut remote = base.clone();
        remote.summary = "Renamed remotely".to_string();
        remote.touch(Utc::now());

        (base, local, remote)
    }

    fn record(local: &Task, remote: Option<&Task>) -> ConflictRecord {
        ConflictRecord {
            id: 1,
            uid: local.uid.clone(),
            list_uid: local.list_uid.clone(),
            local: local.clone(),
            remote: remote.cloned(),
            detected_at: Utc::now(),
            resolution: None,
        }
    }

    #[test]
    fn server_wins_discards_the_local_edit() {
        let (_, local, remote) = conflict_pair();
        let outcome = resolve(
            ConflictResolution::ServerWins,
            &record(&local, Some(&remote)),
            None,
        );
        assert_eq!(outcome.cache_task.as_ref().map(|t| t.priority), Some(1));
        assert!(outcome.cache_is_remote);
        assert!(outcome.push.is_none());
    }

    #[test]
    fn local_wins_pushes_the_local_state() {
        let (_, local, remote) = conflict_pair();
        let outcome = resolve(
            ConflictResolution::LocalWins,
            &record(&local, Some(&remote)),
            None,
        );
        assert_eq!(
            outcome.cache_task.as_ref().map(|t| t.summary.as_str()),
            Some("Original")
        );
        assert!(matches!(outcome.push, Some(PushAction::Update(_))));
    }

    #[test]
    fn merge_takes_each_changed_side() {
        let (base, local, remote) = conflict_pair();
        let outcome = resolve(
            ConflictResolution::Merge,
            &record(&local, Some(&remote)),
            Some(&base),
        );
        let merged = outcome.cache_task.unwrap();
        // Remote changed the summary, local changed the priority.
        assert_eq!(merged.summary, "Renamed remotely");
        assert_eq!(merged.priority, 2);
        assert!(matches!(outcome.push, Some(PushAction::Update(_))));
    }

    #[test]
    fn merge_same_field_change_falls_back_to_local() {
        let (base, mut local, mut remote) = conflict_pair();
        local.summary = "Local title".to_string();
        remote.summary = "Remote title".to_string();
        let outcome = resolve(
            ConflictResolution::Merge,
            &record(&local, Some(&remote)),
            Some(&base),
        );
        assert_eq!(outcome.cache_task.unwrap().summary, "Local title");
    }

    #[test]
    fn merge_unions_categories() {
        let (base, mut local, mut remote) = conflict_pair();
        local.categories = vec!["home".to_string(), "urgent".to_string()];
        remote.categories = vec!["urgent".to_string(), "work".to_string()];
        let outcome = resolve(
            ConflictResolution::Merge,
            &record(&local, Some(&remote)),
            Some(&base),
        );
        assert_eq!(
            outcome.cache_task.unwrap().categories,
            vec!["home", "urgent", "work"]
        );
    }

    #[test]
    fn merge_keeps_completed_invariant() {
        let (base, mut local, remote) = conflict_pair();
        local.set_status(TaskStatus::Completed, Utc::now());
        let outcome = resolve(
            ConflictResolution::Merge,
            &record(&local, Some(&remote)),
            Some(&base),
        );
        let merged = outcome.cache_task.unwrap();
        assert!(merged.validate().is_ok());
    }

    #[test]
    fn keep_both_duplicates_with_suffix() {
        let (_, local, remote) = conflict_pair();
        let outcome = resolve(
            ConflictResolution::KeepBoth,
            &record(&local, Some(&remote)),
            None,
        );
        // Cache takes the remote under the original uid.
        assert_eq!(outcome.cache_task.as_ref().map(|t| t.uid.as_str()), Some("uid-1"));
        let Some(PushAction::Create(copy)) = outcome.push else {
            panic!("expected a create push");
        };
        assert!(copy.summary.ends_with(KEEP_BOTH_SUFFIX));
        assert!(copy.has_placeholder_uid());
    }

    #[test]
    fn remote_tombstone_with_server_wins_deletes_locally() {
        let (_, local, _) = conflict_pair();
        let outcome = resolve(ConflictResolution::ServerWins, &record(&local, None), None);
        assert!(outcome.cache_task.is_none());
        assert!(outcome.push.is_none());
    }

    #[test]
    fn remote_tombstone_with_local_wins_recreates() {
        let (_, local, _) = conflict_pair();
        let outcome = resolve(ConflictResolution::LocalWins, &record(&local, None), None);
        assert!(outcome.cache_task.is_some());
        assert!(matches!(outcome.push, Some(PushAction::Create(_))));
    }
}
