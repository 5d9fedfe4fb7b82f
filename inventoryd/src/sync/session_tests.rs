use super::*;
use crate::sync::snapshot::LoadedSnapshot;
use crate::sync::test_support::{category_json, complete_category, item, item_json};
use inventory_core::FolderContents;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Tree {
    root: Uuid,
    a: Uuid,
    b: Uuid,
    hat: Uuid,
}

fn session_for(server: &MockServer, cache_dir: &Path) -> InventorySession {
    let client = InventoryClient::with_base_url(&server.uri(), "test-token").unwrap();
    let config = SessionConfig {
        agent_id: Uuid::new_v4(),
        primary_root: Uuid::new_v4(),
        library_root: None,
        library_owner_id: Uuid::nil(),
        fetch: FetchConfig::default(),
    };
    InventorySession::new(client, SnapshotCache::new(cache_dir), config).unwrap()
}

/// Root holding folders A (with one item) and B (empty), all complete.
fn install_tree(session: &mut InventorySession) -> Tree {
    let root_id = session.config.primary_root;
    let mut root = complete_category(Uuid::nil(), "My Inventory", 1, 2);
    root.category_id = root_id;
    let a = complete_category(root_id, "A", 1, 1);
    let b = complete_category(root_id, "B", 1, 0);
    let hat = item(a.category_id, "hat");
    let tree = Tree {
        root: root_id,
        a: a.category_id,
        b: b.category_id,
        hat: hat.item_id,
    };
    session
        .model
        .install_snapshot(LoadedSnapshot {
            categories: vec![root, a, b],
            items: vec![hat],
            ..LoadedSnapshot::default()
        })
        .unwrap();
    tree
}

#[tokio::test]
async fn create_category_applies_server_delta() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_for(&server, dir.path());
    let root = session.config.primary_root;
    let created = Uuid::new_v4();
    let mut delta = category_json(created, root, "Stuff");
    delta["version"] = json!(1);
    delta["descendents"] = json!(0);
    Mock::given(method("POST"))
        .and(path(format!("/ais/category/{root}")))
        .respond_with(ResponseTemplate::new(201).set_body_json(delta))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = session
        .create_category(root, "Stuff", FolderType::Plain)
        .await
        .unwrap();

    assert_eq!(outcome.created, 1);
    assert!(session.is_complete(created));
    assert_eq!(session.lookup(created).unwrap().parent_id(), root);
    // The placeholder root has no version yet, so it is listed again.
    assert!(outcome.refetch.contains(&root));
    assert!(session.scheduler().is_tracked(root));
}

#[tokio::test]
async fn move_object_keeps_both_parents_complete() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_for(&server, dir.path());
    let tree = install_tree(&mut session);
    let mut delta = item_json(tree.hat, tree.b, "hat");
    delta["_updated_items"] = json!([tree.hat]);
    delta["_updated_category_versions"] =
        json!({ tree.a.to_string(): 2, tree.b.to_string(): 2 });
    Mock::given(method("PATCH"))
        .and(path(format!("/ais/item/{}", tree.hat)))
        .respond_with(ResponseTemplate::new(200).set_body_json(delta))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = session.move_object(tree.hat, tree.b).await.unwrap();

    assert!(outcome.refetch.is_empty());
    assert!(outcome.mismatches.is_empty());
    let store = session.model().store();
    assert_eq!(store.get_item(tree.hat).unwrap().parent_id, tree.b);
    for (id, declared) in [(tree.a, 0), (tree.b, 1)] {
        let cat = store.get_category(id).unwrap();
        assert_eq!(cat.version, 2);
        assert_eq!(cat.declared_descendants, declared);
        assert!(store.is_complete(id));
    }
}

#[tokio::test]
async fn refused_move_refetches_both_parents() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_for(&server, dir.path());
    let tree = install_tree(&mut session);
    Mock::given(method("PATCH"))
        .and(path(format!("/ais/category/{}", tree.b)))
        .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
        .expect(1)
        .mount(&server)
        .await;

    let err = session.move_object(tree.b, tree.a).await.unwrap_err();

    assert!(matches!(err, SessionError::Api(_)));
    assert!(session.scheduler().is_tracked(tree.root));
    assert!(session.scheduler().is_tracked(tree.a));
}

#[tokio::test]
async fn move_into_own_subtree_is_rejected_locally() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_for(&server, dir.path());
    let tree = install_tree(&mut session);

    let err = session.move_object(tree.root, tree.a).await.unwrap_err();

    assert!(matches!(err, SessionError::Store(StoreError::InvalidMove { .. })));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn remove_object_drops_item_even_with_empty_reply() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_for(&server, dir.path());
    let tree = install_tree(&mut session);
    Mock::given(method("DELETE"))
        .and(path(format!("/ais/item/{}", tree.hat)))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = session.remove_object(tree.hat).await.unwrap();

    assert_eq!(outcome.removed, 1);
    assert!(session.lookup(tree.hat).is_none());
    let a = session.model().store().get_category(tree.a).unwrap();
    assert_eq!(a.declared_descendants, 0);
    assert_eq!(a.version, 2);
    assert!(session.is_complete(tree.a));
}

#[tokio::test]
async fn removing_unknown_object_is_an_error() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_for(&server, dir.path());
    let missing = Uuid::new_v4();

    let err = session.remove_object(missing).await.unwrap_err();

    assert!(matches!(err, SessionError::Store(StoreError::NotFound(id)) if id == missing));
}

#[tokio::test]
async fn full_fetch_is_saved_and_restored() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_for(&server, dir.path());
    let root = session.config.primary_root;
    let hat = Uuid::new_v4();
    let listing = FolderContents {
        folder_id: root,
        owner_id: session.config.agent_id,
        version: 3,
        descendents: 1,
        categories: Vec::new(),
        items: vec![item_json(hat, root, "hat")],
    };
    Mock::given(method("POST"))
        .and(path("/cap/FetchInventoryDescendents2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "folders": [listing] })))
        .expect(1)
        .mount(&server)
        .await;

    session.request_everything();
    for _ in 0..500 {
        session.tick();
        if session.everything_fetched() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(session.everything_fetched());
    assert!(session.is_complete(root));

    session.logout();
    assert!(session.lookup(hat).is_none());
    assert!(!session.request_subtree(root, true));

    let mut restored = InventorySession::new(
        InventoryClient::with_base_url(&server.uri(), "test-token").unwrap(),
        SnapshotCache::new(dir.path()),
        session.config.clone(),
    )
    .unwrap();
    assert_eq!(restored.load_cache().unwrap(), 2);
    assert!(restored.is_complete(root));
    assert_eq!(restored.lookup(hat).unwrap().name(), "hat");
}

#[tokio::test]
async fn missing_snapshot_loads_nothing() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_for(&server, dir.path());

    assert_eq!(session.load_cache().unwrap(), 0);
    assert!(!session.everything_fetched());
}
