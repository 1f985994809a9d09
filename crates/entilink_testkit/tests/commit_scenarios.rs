//! End-to-end flush scenarios against the in-memory service.

use entilink_codec::Value;
use entilink_core::{CoreError, EntityStatus, TransportError};
use entilink_protocol::StreamPayload;
use entilink_testkit::prelude::*;
use serde_json::json;

#[test]
fn batched_flush_creates_linked_graph_in_one_submission() {
    init_test_logging();
    let (session, service) = service_session(CommitMode::Batched);
    let folder = session.container().create("Folders").unwrap();
    folder.set("Name", "Projects").unwrap();
    let file = session.container().create("Files").unwrap();
    file.set("Name", "plan.md").unwrap();
    file.set("Size", 512i64).unwrap();
    file.set_link("Parent", Some(&folder)).unwrap();

    let report = session.flush().unwrap();
    assert_eq!(report.operations, 2);
    assert_eq!(report.created, 2);
    assert_eq!(service.submission_count(), 1);

    assert_eq!(folder.address().as_deref(), Some("Folders(1)"));
    assert_eq!(file.address().as_deref(), Some("Files(1)"));
    assert_eq!(service.property("Files(1)", "Name"), Some(json!("plan.md")));
    assert_eq!(service.links("Files(1)", "Parent"), vec!["Folders(1)".to_string()]);
    assert_eq!(session.tracked_count(), 0);
}

#[test]
fn sequential_flush_submits_each_operation() {
    init_test_logging();
    let (session, service) = service_session(CommitMode::Sequential);
    let folder = session.container().create("Folders").unwrap();
    let first = session.container().create("Files").unwrap();
    let second = session.container().create("Files").unwrap();
    folder.set_links("Files", [&first, &second]).unwrap();

    let report = session.flush().unwrap();
    assert_eq!(report.operations, 3);
    assert_eq!(report.submissions, 3);
    assert_eq!(service.submission_count(), 3);
    assert_eq!(
        service.links("Folders(1)", "Files"),
        vec!["Files(1)".to_string(), "Files(2)".to_string()]
    );
}

#[test]
fn committed_graph_is_visible_to_other_sessions() {
    let (session, service) = service_session(CommitMode::Batched);
    let folder = session.container().create("Folders").unwrap();
    folder.set("Name", "Archive").unwrap();
    let file = session.container().create("Files").unwrap();
    file.set_link("Parent", Some(&folder)).unwrap();
    folder.add_link("Files", &file).unwrap();
    session.flush().unwrap();

    let other = reopen(&service, CommitMode::Batched);
    let files = other.container().entity_set("Files").unwrap();
    let fetched = files.by_key(1).unwrap();
    let parent = fetched.navigate("Parent").unwrap().unwrap();
    assert_eq!(parent.get("Name").unwrap(), Value::from("Archive"));

    let children = parent.navigate_collection("Files").unwrap();
    assert_eq!(children.len(), 1);
    assert!(children.contains(&fetched));
}

#[test]
fn cyclic_links_are_committed_in_both_modes() {
    for mode in [CommitMode::Batched, CommitMode::Sequential] {
        let (session, service) = service_session(mode);
        let a = session.container().create("Files").unwrap();
        let b = session.container().create("Files").unwrap();
        a.set_link("Related", Some(&b)).unwrap();
        b.set_link("Related", Some(&a)).unwrap();

        let report = session.flush().unwrap();
        assert_eq!(report.deferred_links, 1);

        let a_address = a.address().unwrap();
        let b_address = b.address().unwrap();
        assert_eq!(service.links(&a_address, "Related"), vec![b_address.clone()]);
        assert_eq!(service.links(&b_address, "Related"), vec![a_address]);
    }
}

#[test]
fn edited_record_in_a_cycle_commits_in_both_modes() {
    for mode in [CommitMode::Batched, CommitMode::Sequential] {
        init_test_logging();
        let (session, service) = service_session(mode);
        let a_address = service.insert("Folders", json!({"Name": "A"}));
        let a = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();
        let b = session.container().create("Folders").unwrap();
        b.set_link("Parent", Some(&a)).unwrap();
        a.set("Name", "A2").unwrap();
        a.set_link("Parent", Some(&b)).unwrap();

        let report = session.flush().unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.deferred_links, 1);

        let b_address = b.address().unwrap();
        assert_eq!(service.links(&a_address, "Parent"), vec![b_address.clone()]);
        assert_eq!(service.links(&b_address, "Parent"), vec![a_address.clone()]);
        assert_eq!(service.property(&a_address, "Name"), Some(json!("A2")));
        assert_eq!(a.etag(), service.etag(&a_address));
        assert!(!session.has_pending_changes());
    }
}

#[test]
fn set_links_replaces_the_stored_collection() {
    for mode in [CommitMode::Batched, CommitMode::Sequential] {
        let (session, service) = service_session(mode);
        let folder_address = service.insert("Folders", json!({"Name": "Inbox"}));
        let old = service.insert("Files", json!({"Name": "old.txt"}));
        let kept = service.insert("Files", json!({"Name": "kept.txt"}));
        service.link(&folder_address, "Files", &old);
        service.link(&folder_address, "Files", &kept);

        let folder = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();
        let kept_file = session.container().entity_set("Files").unwrap().by_key(2).unwrap();
        let added = session.container().create("Files").unwrap();
        folder.set_links("Files", [&kept_file, &added]).unwrap();

        let report = session.flush().unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 2);
        assert_eq!(
            service.links(&folder_address, "Files"),
            vec![kept.clone(), "Files(3)".to_string()]
        );
        assert!(service.contains(&old));
        assert_eq!(folder.navigate_collection("Files").unwrap().len(), 2);
        assert!(!session.has_pending_changes());
    }
}

#[test]
fn add_link_keeps_the_stored_collection() {
    let (session, service) = service_session(CommitMode::Batched);
    let folder_address = service.insert("Folders", json!({"Name": "Inbox"}));
    let first = service.insert("Files", json!({"Name": "first.txt"}));
    service.link(&folder_address, "Files", &first);

    let folder = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();
    let added = session.container().create("Files").unwrap();
    folder.add_link("Files", &added).unwrap();
    session.flush().unwrap();

    assert_eq!(
        service.links(&folder_address, "Files"),
        vec![first, "Files(2)".to_string()]
    );
}

#[test]
fn updates_send_only_changed_properties() {
    let (session, service) = service_session(CommitMode::Batched);
    let address = service.insert("Files", json!({"Name": "draft.txt", "Size": 10}));
    let file = session.container().entity_set("Files").unwrap().by_key(1).unwrap();
    assert_eq!(file.get("Size").unwrap(), Value::Integer(10));

    file.set("Name", "final.txt").unwrap();
    assert_eq!(file.status().unwrap(), EntityStatus::Changed);
    let report = session.flush().unwrap();
    assert_eq!(report.updated, 1);

    assert_eq!(service.property(&address, "Name"), Some(json!("final.txt")));
    assert_eq!(service.property(&address, "Size"), Some(json!(10)));
    assert_eq!(file.etag(), service.etag(&address));
    assert_eq!(file.get("Name").unwrap(), Value::from("final.txt"));
}

#[test]
fn stale_etag_aborts_batched_flush() {
    let (first, service) = service_session(CommitMode::Batched);
    service.insert("Folders", json!({"Name": "Shared"}));
    let second = reopen(&service, CommitMode::Batched);

    let mine = first.container().entity_set("Folders").unwrap().by_key(1).unwrap();
    let theirs = second.container().entity_set("Folders").unwrap().by_key(1).unwrap();
    mine.get("Name").unwrap();
    theirs.get("Name").unwrap();

    theirs.set("Name", "Theirs").unwrap();
    second.flush().unwrap();

    mine.set("Name", "Mine").unwrap();
    assert!(matches!(
        first.flush(),
        Err(CoreError::TransactionAborted { .. })
    ));
    assert_eq!(mine.status().unwrap(), EntityStatus::Changed);
    assert_eq!(service.property("Folders(1)", "Name"), Some(json!("Theirs")));

    mine.refresh().unwrap();
    first.flush().unwrap();
    assert_eq!(service.property("Folders(1)", "Name"), Some(json!("Mine")));
}

#[test]
fn failed_batch_leaves_service_and_handles_unchanged() {
    let (session, service) = service_session(CommitMode::Batched);
    service.reject_nth_operation(2, 500, "storage unavailable");
    let folder = session.container().create("Folders").unwrap();
    let file = session.container().create("Files").unwrap();
    file.set_link("Parent", Some(&folder)).unwrap();

    let err = session.flush().unwrap_err();
    assert!(matches!(err, CoreError::TransactionAborted { .. }));
    assert_eq!(service.count("Folders"), 0);
    assert_eq!(service.count("Files"), 0);
    assert!(folder.address().is_none());
    assert_eq!(folder.status().unwrap(), EntityStatus::New);
    assert_eq!(file.status().unwrap(), EntityStatus::New);

    let report = session.flush().unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(service.links("Files(1)", "Parent"), vec!["Folders(1)".to_string()]);
}

#[test]
fn sequential_failure_keeps_partial_commit() {
    let (session, service) = service_session(CommitMode::Sequential);
    service.reject_nth_operation(2, 503, "busy");
    let first = session.container().create("Files").unwrap();
    first.set("Name", "one").unwrap();
    let second = session.container().create("Files").unwrap();
    second.set("Name", "two").unwrap();
    let third = session.container().create("Files").unwrap();
    third.set("Name", "three").unwrap();

    let err = session.flush().unwrap_err();
    match &err {
        CoreError::Transport(inner @ TransportError::Rejected { status: 503, .. }) => {
            assert!(inner.is_retryable());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(service.count("Files"), 1);
    assert_eq!(first.status().unwrap(), EntityStatus::Attached);
    assert!(first.changed_properties().is_empty());
    assert_eq!(second.status().unwrap(), EntityStatus::New);
    assert_eq!(third.status().unwrap(), EntityStatus::New);

    let report = session.flush().unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(service.count("Files"), 3);
}

#[test]
fn deletion_removes_the_record_and_the_handle() {
    let (session, service) = service_session(CommitMode::Batched);
    let folder_address = service.insert("Folders", json!({"Name": "Old"}));
    let file_address = service.insert("Files", json!({"Name": "a.txt"}));
    service.link(&file_address, "Parent", &folder_address);

    let file = session.container().entity_set("Files").unwrap().by_key(1).unwrap();
    let folder = file.navigate("Parent").unwrap().unwrap();
    folder.delete().unwrap();
    assert_eq!(folder.status().unwrap(), EntityStatus::Deleted);

    let report = session.flush().unwrap();
    assert_eq!(report.deleted, 1);
    assert!(!service.contains(&folder_address));
    assert!(folder.is_removed());
    assert!(matches!(folder.get("Name"), Err(CoreError::Removed { .. })));
    assert!(matches!(file.navigate("Parent"), Err(CoreError::Removed { .. })));
}

#[test]
fn media_and_named_streams_follow_the_create() {
    for mode in [CommitMode::Batched, CommitMode::Sequential] {
        let (session, service) = service_session(mode);
        let photo = session.container().create("Photos").unwrap();
        photo.set("Caption", "Harbor").unwrap();
        photo
            .set_media(StreamPayload::new("image/jpeg", vec![0xffu8, 0xd8, 0xff]))
            .unwrap();
        photo
            .set_stream("Thumbnail", StreamPayload::new("image/png", vec![0x89u8]))
            .unwrap();

        let report = session.flush().unwrap();
        assert_eq!(report.operations, 3);
        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 2);

        let address = photo.address().unwrap();
        let media = service.media(&address).unwrap();
        assert_eq!(media.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(service.stream(&address, "Thumbnail").unwrap().len(), 1);

        assert_eq!(photo.get_media().unwrap().len(), 3);
    }
}

#[test]
fn media_replacement_checks_the_media_etag() {
    let (session, service) = service_session(CommitMode::Batched);
    let address = service.insert("Photos", json!({"Caption": "Old"}));
    service.put_media(&address, StreamPayload::new("image/png", vec![1u8]));

    let photo = session.container().entity_set("Photos").unwrap().by_key(1).unwrap();
    assert_eq!(photo.get_media().unwrap().len(), 1);
    photo
        .set_media(StreamPayload::new("image/png", vec![2u8, 3]))
        .unwrap();
    session.flush().unwrap();
    assert_eq!(service.media(&address).unwrap().len(), 2);

    service.put_media(&address, StreamPayload::new("image/png", vec![9u8]));
    photo
        .set_media(StreamPayload::new("image/png", vec![4u8]))
        .unwrap();
    assert!(matches!(
        session.flush(),
        Err(CoreError::TransactionAborted { .. })
    ));
}

#[test]
fn disconnected_service_surfaces_transport_error() {
    let (session, service) = service_session(CommitMode::Batched);
    session.container().create("Folders").unwrap();
    service.set_connected(false);
    assert!(matches!(
        session.flush(),
        Err(CoreError::Transport(TransportError::NotConnected))
    ));
    assert!(session.has_pending_changes());

    service.set_connected(true);
    session.flush().unwrap();
    assert_eq!(service.count("Folders"), 1);
}

#[test]
fn stats_accumulate_across_flushes() {
    let (session, service) = service_session(CommitMode::Batched);
    session.container().create("Folders").unwrap();
    session.flush().unwrap();
    service.reject_nth_operation(1, 400, "bad request");
    session.container().create("Folders").unwrap();
    assert!(session.flush().is_err());

    let stats = session.stats();
    assert_eq!(stats.flushes, 1);
    assert_eq!(stats.failed_flushes, 1);
    assert_eq!(stats.operations_committed, 1);
    assert!(stats.last_error.is_some());
}
