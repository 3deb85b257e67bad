//! Unit tests for the reconciler
//!
//! Tests cover:
//! - Optimistic create/update/delete with confirm and rollback
//! - Delete retry and 404 handling
//! - Notification merge while mutations are in flight
//! - Rollback while other mutations overlap
//! - Debounced backstop refetch

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use content_sync::api::RetryConfig;
use content_sync::cache::{Entity, Identity};
use content_sync::errors::{ApiError, SyncError};
use content_sync::reconcile::{
    ChangeAction, ChangeEvent, MergeOutcome, MutationKind, MutationState, Reconciler,
    ReconcilerOptions,
};

use super::helpers::{obj, Call, MockApi};

fn options() -> ReconcilerOptions {
    ReconcilerOptions {
        refetch_delay: None,
        ..ReconcilerOptions::default()
    }
}

fn reconciler(api: &Arc<MockApi>) -> Arc<Reconciler> {
    Arc::new(Reconciler::new("posts", api.clone(), options()))
}

fn seed(reconciler: &Reconciler, rows: Vec<serde_json::Value>) {
    reconciler.load(rows.into_iter().filter_map(Entity::from_value).collect());
}

async fn until(mut check: impl FnMut() -> bool) {
    while !check() {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Create
// ============================================================================

mod create_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_confirm_replaces_optimistic_row() {
        let api = MockApi::new();
        api.push_create(Ok(json!({"id": 42, "title": "A"})));
        let r = reconciler(&api);

        let created = r.create(obj(json!({"title": "A"}))).await.unwrap();
        assert_eq!(created.identity(), Some(Identity::from(42)));

        let snapshot = r.snapshot();
        assert_eq!(snapshot.len(), 1);
        let entity = &snapshot.entries[0];
        assert_eq!(entity.get("id"), Some(&json!(42)));
        assert!(!entity.optimistic);
        assert!(entity.temp_key.is_none());
        assert!(r.pending_mutations().is_empty());
    }

    #[tokio::test]
    async fn test_create_is_visible_before_confirmation() {
        let api = MockApi::new();
        let release = api.hold();
        let r = reconciler(&api);

        let task = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.create(obj(json!({"title": "Draft"}))).await }
        });
        until(|| r.snapshot().len() == 1).await;

        let snapshot = r.snapshot();
        assert!(snapshot.entries[0].optimistic);
        assert!(snapshot.entries[0].temp_key.is_some());
        let pending = r.pending_mutations();
        assert_eq!(pending.len(), 1);
        let (id, kind) = pending[0];
        assert_eq!(kind, MutationKind::Create);
        assert_eq!(r.mutation_state(id), Some(MutationState::Pending));

        release.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(r.mutation_state(id), Some(MutationState::Confirmed));
        assert!(!r.snapshot().entries[0].optimistic);
    }

    #[tokio::test]
    async fn test_create_failure_rolls_back() {
        let api = MockApi::new();
        api.push_create(Err(ApiError::HttpStatus {
            status: 500,
            message: "boom".into(),
        }));
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 1, "title": "Existing"})]);
        let before = r.snapshot();

        let err = r.create(obj(json!({"title": "A"}))).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Api(ApiError::HttpStatus { status: 500, .. })
        ));
        assert!(r.snapshot().same_entries(&before));
        // Creates are never retried
        assert_eq!(api.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_create_racing_created_notification() {
        let api = MockApi::new();
        api.push_create(Ok(json!({"id": 42, "title": "A"})));
        let release = api.hold();
        let r = reconciler(&api);

        let task = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.create(obj(json!({"title": "A"}))).await }
        });
        until(|| r.snapshot().len() == 1).await;

        // Server announces the record before the POST answers
        let outcome = r.apply_notification(&ChangeEvent::new(
            "post",
            ChangeAction::Created,
            obj(json!({"id": 42, "title": "A"})),
        ));
        assert_eq!(outcome, MergeOutcome::Appended);

        release.send(()).unwrap();
        task.await.unwrap().unwrap();

        let snapshot = r.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.entries[0].get("id"), Some(&json!(42)));
        assert!(snapshot.entries[0].temp_key.is_none());
        // The request body never carries the client key
        assert_eq!(
            api.calls(),
            vec![Call::Create("posts".into(), obj(json!({"title": "A"})))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_timeout_rolls_back() {
        let api = MockApi::new();
        let _never = api.hold();
        let r = Reconciler::new(
            "posts",
            api.clone(),
            ReconcilerOptions {
                request_timeout: Some(Duration::from_secs(5)),
                ..options()
            },
        );

        let err = r.create(obj(json!({"title": "A"}))).await.unwrap_err();
        assert!(matches!(err, SyncError::Api(ApiError::Timeout)));
        assert!(r.snapshot().is_empty());
    }
}

// ============================================================================
// Update
// ============================================================================

mod update_tests {
    use super::*;

    #[tokio::test]
    async fn test_update_confirm_merges_server_fields() {
        let api = MockApi::new();
        api.push_update(Ok(json!({"id": 1, "title": "New", "updatedAt": "now"})));
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 1, "title": "Old", "body": "b"})]);

        let updated = r.update(1, obj(json!({"title": "New"}))).await.unwrap();
        assert_eq!(updated.get("title"), Some(&json!("New")));
        assert_eq!(updated.get("body"), Some(&json!("b")));
        assert_eq!(updated.get("updatedAt"), Some(&json!("now")));
        assert!(!updated.optimistic);
    }

    #[tokio::test]
    async fn test_update_failure_restores_snapshot() {
        let api = MockApi::new();
        api.push_update(Err(ApiError::HttpStatus {
            status: 403,
            message: "forbidden".into(),
        }));
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 1, "title": "Old"}), json!({"id": 2})]);
        let before = r.snapshot();

        assert!(r.update(1, obj(json!({"title": "New"}))).await.is_err());
        assert!(r.snapshot().same_entries(&before));
        assert!(r.snapshot().version > before.version);
    }

    #[tokio::test]
    async fn test_update_unknown_identity_is_an_error() {
        let api = MockApi::new();
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 1})]);

        let err = r.update(99, obj(json!({"title": "x"}))).await.unwrap_err();
        assert!(matches!(err, SyncError::IdentityNotFound { .. }));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_addresses_resolved_identity() {
        let api = MockApi::new();
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 5, "docId": "abc"})]);

        r.update("abc", obj(json!({"title": "x"}))).await.unwrap();
        assert_eq!(
            api.calls(),
            vec![Call::Update(
                "posts".into(),
                Identity::from(5),
                obj(json!({"title": "x"}))
            )]
        );
    }

    #[tokio::test]
    async fn test_update_matches_coerced_identity() {
        let api = MockApi::new();
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": "7", "title": "Old"})]);

        let updated = r.update(7, obj(json!({"title": "New"}))).await.unwrap();
        assert_eq!(updated.get("title"), Some(&json!("New")));
    }

    #[tokio::test]
    async fn test_unstamped_notification_keeps_in_flight_field() {
        let api = MockApi::new();
        let release = api.hold();
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 1, "title": "Old", "views": 0})]);

        let task = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.update(1, obj(json!({"title": "Mine"}))).await }
        });
        until(|| r.snapshot().entries[0].optimistic).await;

        let outcome = r.apply_notification(&ChangeEvent::new(
            "post",
            ChangeAction::Updated,
            obj(json!({"id": 1, "title": "Theirs", "views": 9})),
        ));
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                protected: vec!["title".to_string()]
            }
        );

        release.send(()).unwrap();
        task.await.unwrap().unwrap();
        let entity = r.find(1).unwrap();
        assert_eq!(entity.get("title"), Some(&json!("Mine")));
        assert_eq!(entity.get("views"), Some(&json!(9)));
        assert!(!entity.optimistic);
    }
}

// ============================================================================
// Delete
// ============================================================================

mod delete_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_delete_retries_transient_failures() {
        let api = MockApi::new();
        api.push_delete(Err(ApiError::HttpStatus {
            status: 503,
            message: "unavailable".into(),
        }));
        api.push_delete(Err(ApiError::Network("reset".into())));
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 1}), json!({"id": 2})]);

        r.delete(1).await.unwrap();
        assert_eq!(api.delete_calls(), 3);
        assert!(r.find(1).is_none());
        assert_eq!(r.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_404_counts_as_confirmed() {
        let api = MockApi::new();
        api.push_delete(Err(ApiError::HttpStatus {
            status: 404,
            message: "not found".into(),
        }));
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 1})]);

        r.delete(1).await.unwrap();
        assert!(r.snapshot().is_empty());
        assert_eq!(api.delete_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_budget_exhausted_restores_snapshot() {
        let api = MockApi::new();
        for _ in 0..4 {
            api.push_delete(Err(ApiError::HtmlErrorPage { status: 502 }));
        }
        let r = Reconciler::new(
            "posts",
            api.clone(),
            ReconcilerOptions {
                retry: RetryConfig::default(),
                ..options()
            },
        );
        seed(&r, vec![json!({"id": 1}), json!({"id": 2})]);
        let before = r.snapshot();

        let err = r.delete(2).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Api(ApiError::HtmlErrorPage { status: 502 })
        ));
        assert_eq!(api.delete_calls(), 4);
        assert!(r.snapshot().same_entries(&before));
    }

    #[tokio::test]
    async fn test_delete_unknown_identity_is_an_error() {
        let api = MockApi::new();
        let r = reconciler(&api);
        let err = r.delete("missing").await.unwrap_err();
        assert!(matches!(err, SyncError::IdentityNotFound { .. }));
        assert_eq!(api.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_is_optimistic() {
        let api = MockApi::new();
        let release = api.hold();
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 1}), json!({"id": 2})]);

        let task = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.delete(1).await }
        });
        until(|| r.snapshot().len() == 1).await;
        assert_eq!(r.pending_mutations()[0].1, MutationKind::Delete);

        release.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(r.pending_mutations().is_empty());
    }
}

// ============================================================================
// Notifications & refetch
// ============================================================================

mod notification_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_notification_for_unknown_record_is_noop() {
        let api = MockApi::new();
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 1}), json!({"id": 2})]);
        let before = r.snapshot();

        let outcome = r.apply_notification(&ChangeEvent::new(
            "post",
            ChangeAction::Deleted,
            obj(json!({"id": 7})),
        ));
        assert_eq!(outcome, MergeOutcome::Removed(0));
        assert!(r.snapshot().same_entries(&before));
    }

    #[tokio::test]
    async fn test_duplicate_created_is_idempotent() {
        let api = MockApi::new();
        let r = reconciler(&api);
        let event = ChangeEvent::new("post", ChangeAction::Created, obj(json!({"id": 3})));
        r.apply_notification(&event);
        r.apply_notification(&event);
        assert_eq!(r.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_loads_and_dedupes() {
        let api = MockApi::with_list(vec![
            json!({"id": 1}),
            json!({"id": "1"}),
            json!("not a record"),
            json!({"docId": "b"}),
        ]);
        let r = reconciler(&api);
        r.refresh().await.unwrap();
        let snapshot = r.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(api.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backstop_refetch_is_debounced() {
        let api = MockApi::with_list(vec![json!({"id": 1}), json!({"id": 2})]);
        let r = Reconciler::new(
            "posts",
            api.clone(),
            ReconcilerOptions {
                refetch_delay: Some(Duration::from_millis(1000)),
                ..options()
            },
        );

        let created = ChangeEvent::new("post", ChangeAction::Created, obj(json!({"id": 1})));
        r.apply_notification(&created);
        tokio::time::sleep(Duration::from_millis(500)).await;
        r.apply_notification(&created);
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(api.list_calls(), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(api.list_calls(), 1);
        assert_eq!(r.snapshot().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backstop_refetch_skipped_while_mutation_pending() {
        let api = MockApi::with_list(vec![json!({"id": 1})]);
        let r = Arc::new(Reconciler::new(
            "posts",
            api.clone(),
            ReconcilerOptions {
                refetch_delay: Some(Duration::from_millis(1000)),
                request_timeout: None,
                ..options()
            },
        ));
        let release = api.hold();

        let task = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.create(obj(json!({"title": "A"}))).await }
        });
        until(|| r.snapshot().len() == 1).await;
        r.apply_notification(&ChangeEvent::new(
            "post",
            ChangeAction::Deleted,
            obj(json!({"id": 99})),
        ));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(api.list_calls(), 0);
        assert!(r.snapshot().entries[0].optimistic);

        release.send(()).unwrap();
        task.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(api.list_calls(), 1);
        assert_eq!(r.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_notification_without_identity_is_dropped() {
        let api = MockApi::new();
        let r = reconciler(&api);
        let outcome = r.apply_notification(&ChangeEvent::new(
            "post",
            ChangeAction::Updated,
            obj(json!({"title": "orphan"})),
        ));
        assert_eq!(outcome, MergeOutcome::MissingIdentity);
        assert!(r.snapshot().is_empty());
    }
}

// ============================================================================
// Overlapping mutations
// ============================================================================

mod overlap_tests {
    use super::*;

    fn server_error(status: u16) -> ApiError {
        ApiError::HttpStatus {
            status,
            message: "rejected".into(),
        }
    }

    #[tokio::test]
    async fn test_failed_create_keeps_create_confirmed_meanwhile() {
        let api = MockApi::new();
        api.push_create(Ok(json!({"id": 42, "title": "A"})));
        api.push_create(Err(server_error(500)));
        let r = reconciler(&api);

        let release_a = api.hold();
        let a = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.create(obj(json!({"title": "A"}))).await }
        });
        until(|| api.create_calls() == 1).await;
        let release_b = api.hold();
        let b = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.create(obj(json!({"title": "B"}))).await }
        });
        until(|| api.create_calls() == 2).await;
        assert_eq!(r.snapshot().len(), 2);

        release_a.send(()).unwrap();
        a.await.unwrap().unwrap();
        release_b.send(()).unwrap();
        assert!(b.await.unwrap().is_err());

        assert!(r.pending_mutations().is_empty());
        let snapshot = r.snapshot();
        assert_eq!(snapshot.len(), 1);
        let entity = r.find(42).unwrap();
        assert_eq!(entity.get("title"), Some(&json!("A")));
        assert!(!entity.optimistic);
        assert!(entity.temp_key.is_none());
    }

    #[tokio::test]
    async fn test_failed_update_clears_flag_after_earlier_update_confirmed() {
        let api = MockApi::new();
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 1, "a": 0, "b": 0})]);

        let release_first = api.hold();
        let first = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.update(1, obj(json!({"a": 1}))).await }
        });
        until(|| api.calls().len() == 1).await;
        let release_second = api.hold();
        let second = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.update(1, obj(json!({"b": 1}))).await }
        });
        until(|| api.calls().len() == 2).await;

        release_first.send(()).unwrap();
        first.await.unwrap().unwrap();
        assert!(r.find(1).unwrap().optimistic);

        api.push_update(Err(server_error(400)));
        release_second.send(()).unwrap();
        assert!(second.await.unwrap().is_err());

        assert!(r.pending_mutations().is_empty());
        let entity = r.find(1).unwrap();
        assert_eq!(entity.fields, obj(json!({"id": 1, "a": 1, "b": 0})));
        assert!(!entity.optimistic);
    }

    #[tokio::test]
    async fn test_failed_update_hands_prior_value_to_later_write() {
        let api = MockApi::new();
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 1, "title": "Orig"})]);

        api.push_update(Err(server_error(400)));
        api.push_update(Err(server_error(400)));
        let release_first = api.hold();
        let first = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.update(1, obj(json!({"title": "One"}))).await }
        });
        until(|| api.calls().len() == 1).await;
        let release_second = api.hold();
        let second = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.update(1, obj(json!({"title": "Two"}))).await }
        });
        until(|| api.calls().len() == 2).await;

        // The earlier write fails first; the later one still shows
        release_first.send(()).unwrap();
        assert!(first.await.unwrap().is_err());
        let entity = r.find(1).unwrap();
        assert_eq!(entity.get("title"), Some(&json!("Two")));
        assert!(entity.optimistic);

        release_second.send(()).unwrap();
        assert!(second.await.unwrap().is_err());
        let entity = r.find(1).unwrap();
        assert_eq!(entity.get("title"), Some(&json!("Orig")));
        assert!(!entity.optimistic);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_update_confirmed_meanwhile() {
        let api = MockApi::new();
        let r = reconciler(&api);
        seed(&r, vec![json!({"id": 1}), json!({"id": 2, "title": "Old"})]);

        api.push_delete(Err(server_error(403)));
        let release_delete = api.hold();
        let delete = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.delete(1).await }
        });
        until(|| api.delete_calls() == 1).await;

        r.update(2, obj(json!({"title": "New"}))).await.unwrap();
        release_delete.send(()).unwrap();
        assert!(delete.await.unwrap().is_err());

        let snapshot = r.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.entries[0].identity(), Some(Identity::from(1)));
        assert_eq!(snapshot.entries[1].get("title"), Some(&json!("New")));
        assert!(snapshot.entries.iter().all(|e| !e.optimistic));
    }
}
