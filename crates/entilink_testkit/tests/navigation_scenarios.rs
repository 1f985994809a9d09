//! Reads, navigation and container access against the in-memory service.

use entilink_codec::Value;
use entilink_core::{CoreError, EntityStatus};
use entilink_testkit::prelude::*;
use serde_json::json;

#[test]
fn entities_are_deduplicated_across_reads() {
    let (session, service) = service_session(CommitMode::Batched);
    service.insert("Files", json!({"Name": "a.txt"}));
    service.insert("Files", json!({"Name": "b.txt"}));

    let files = session.container().entity_set("Files").unwrap();
    let all = files.execute().unwrap();
    assert_eq!(all.len(), 2);
    let first = files.by_key(1).unwrap();
    assert!(all.contains(&first));
    assert!(first.same_entity(&files.by_key(1).unwrap()));
}

#[test]
fn query_options_reach_the_service() {
    let (session, service) = service_session(CommitMode::Batched);
    for name in ["a", "b", "c"] {
        service.insert("Files", json!({"Name": name}));
    }
    let page = session
        .container()
        .entity_set("Files")
        .unwrap()
        .order_by("Name")
        .skip(1)
        .top(1)
        .execute()
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page.get(0).unwrap().get("Name").unwrap(), Value::from("b"));
}

#[test]
fn missing_entities_are_not_found() {
    let (session, _) = service_session(CommitMode::Batched);
    let files = session.container().entity_set("Files").unwrap();
    assert!(matches!(files.by_key(42), Err(CoreError::NotFound { .. })));
    assert!(matches!(
        session.container().entity_set("Drafts"),
        Err(CoreError::NotFound { .. })
    ));
}

#[test]
fn navigation_targets_are_fetched_once() {
    let (session, service) = service_session(CommitMode::Batched);
    let folder = service.insert("Folders", json!({"Name": "Docs"}));
    let file = service.insert("Files", json!({"Name": "a.txt"}));
    service.link(&file, "Parent", &folder);

    let handle = session.container().entity_set("Files").unwrap().by_key(1).unwrap();
    let reads_before = service.fetch_count();
    let parent = handle.navigate("Parent").unwrap().unwrap();
    let again = handle.navigate("Parent").unwrap().unwrap();
    assert!(parent.same_entity(&again));
    assert_eq!(service.fetch_count(), reads_before + 1);

    assert!(!parent.is_attached());
    assert_eq!(parent.get("Name").unwrap(), Value::from("Docs"));
    assert_eq!(parent.status().unwrap(), EntityStatus::Attached);
}

#[test]
fn unset_navigation_is_none() {
    let (session, service) = service_session(CommitMode::Batched);
    service.insert("Files", json!({"Name": "orphan.txt"}));
    let file = session.container().entity_set("Files").unwrap().by_key(1).unwrap();
    assert!(file.navigate("Parent").unwrap().is_none());
}

#[test]
fn new_entities_cannot_navigate() {
    let (session, _) = service_session(CommitMode::Batched);
    let folder = session.container().create("Folders").unwrap();
    assert!(matches!(
        folder.navigate_collection("Files"),
        Err(CoreError::NotYetDurable { .. })
    ));
    assert!(matches!(
        folder.navigate("Parent"),
        Err(CoreError::NotYetDurable { .. })
    ));
}

#[test]
fn pending_links_are_visible_before_flush() {
    let (session, _) = service_session(CommitMode::Batched);
    let folder = session.container().create("Folders").unwrap();
    let file = session.container().create("Files").unwrap();
    folder.add_link("Files", &file).unwrap();

    let files = folder.navigate_collection("Files").unwrap();
    assert_eq!(files.len(), 1);
    assert!(files.contains(&file));
    assert!(files.uri().is_none());
}

#[test]
fn singletons_are_fetched_once_and_updatable() {
    let (session, service) = service_session(CommitMode::Batched);
    service.insert_singleton("Settings", json!({"Id": 1, "Theme": "dark"}));

    let settings = session.container().singleton("Settings").unwrap();
    let again = session.container().singleton("Settings").unwrap();
    assert!(settings.same_entity(&again));
    assert_eq!(service.fetch_count(), 1);
    assert_eq!(settings.get("Theme").unwrap(), Value::from("dark"));

    settings.set("Theme", "light").unwrap();
    session.flush().unwrap();
    assert_eq!(service.property("Settings", "Theme"), Some(json!("light")));
}

#[test]
fn bound_operations_need_a_backing_collection() {
    let (session, service) = service_session(CommitMode::Batched);
    service.insert("Files", json!({"Name": "big.bin"}));

    let adhoc = session.container().new_collection("Docs.File").unwrap();
    assert!(matches!(
        adhoc.invoke("Compress", &json!({})),
        Err(CoreError::NotFlushed)
    ));

    let files = session.container().entity_set("Files").unwrap().execute().unwrap();
    let result = files.invoke("Compress", &json!({"level": 9})).unwrap();
    assert_eq!(result["operation"], json!("Compress"));
    assert_eq!(
        service.invocations(),
        vec![("Files".to_string(), "Compress".to_string())]
    );
    assert!(matches!(
        files.invoke("Archive", &json!({})),
        Err(CoreError::IllegalArgument { .. })
    ));
}

#[test]
fn refresh_picks_up_remote_changes() {
    let (session, service) = service_session(CommitMode::Batched);
    service.insert("Folders", json!({"Name": "Before"}));
    let folder = session.container().entity_set("Folders").unwrap().by_key(1).unwrap();
    assert_eq!(folder.get("Name").unwrap(), Value::from("Before"));

    let other = reopen(&service, CommitMode::Batched);
    let remote = other.container().entity_set("Folders").unwrap().by_key(1).unwrap();
    remote.set("Name", "After").unwrap();
    other.flush().unwrap();

    assert_eq!(folder.get("Name").unwrap(), Value::from("Before"));
    folder.refresh().unwrap();
    assert_eq!(folder.get("Name").unwrap(), Value::from("After"));
    assert_eq!(folder.etag(), service.etag("Folders(1)"));
}

#[test]
fn deleting_unsaved_entity_sends_nothing() {
    let (session, service) = service_session(CommitMode::Batched);
    let draft = session.container().create("Files").unwrap();
    draft.set("Name", "scratch").unwrap();
    draft.delete().unwrap();
    assert!(!draft.is_attached());

    let report = session.flush().unwrap();
    assert!(report.is_empty());
    assert_eq!(service.submission_count(), 0);
}
