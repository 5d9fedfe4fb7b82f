use inventory_core::{
    ApiErrorClass, Destination, FolderRequest, FolderType, InventoryApiError, InventoryClient,
    ItemRequest,
};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn fetch_descendents_posts_folder_batch() {
    let server = MockServer::start().await;
    let folder = Uuid::new_v4();
    let owner = Uuid::new_v4();
    let child = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/cap/FetchInventoryDescendents2"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({
            "folders": [{ "folder_id": folder, "owner_id": owner, "fetch_items": true }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "folders": [{
                "folder_id": folder,
                "owner_id": owner,
                "version": 4,
                "descendents": 1,
                "categories": [{
                    "category_id": child,
                    "parent_id": folder,
                    "name": "Child",
                    "type_default": -1
                }],
                "items": []
            }],
            "bad_folders": [{ "folder_id": Uuid::nil(), "error": "Unknown" }]
        })))
        .mount(&server)
        .await;

    let client = InventoryClient::with_base_url(&server.uri(), "test-token").unwrap();
    let response = client
        .fetch_descendents(Destination::Primary, &[FolderRequest::new(folder, owner)])
        .await
        .unwrap();

    assert_eq!(response.folders.len(), 1);
    assert_eq!(response.folders[0].version, 4);
    assert_eq!(response.folders[0].categories[0]["name"], "Child");
    assert_eq!(response.bad_folders[0].error, "Unknown");
}

#[tokio::test]
async fn library_items_use_library_endpoint() {
    let server = MockServer::start().await;
    let agent = Uuid::new_v4();
    let item = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/cap/FetchLib2"))
        .and(body_partial_json(json!({ "agent_id": agent })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "agent_id": agent,
            "items": [{ "item_id": item, "name": "Shared" }]
        })))
        .mount(&server)
        .await;

    let client = InventoryClient::with_base_url(&server.uri(), "test-token").unwrap();
    let response = client
        .fetch_items(
            Destination::Library,
            agent,
            &[ItemRequest {
                owner_id: Uuid::nil(),
                item_id: item,
            }],
        )
        .await
        .unwrap();

    assert_eq!(response.agent_id, Some(agent));
    assert_eq!(response.items.len(), 1);
}

#[tokio::test]
async fn create_category_returns_delta_payload() {
    let server = MockServer::start().await;
    let parent = Uuid::new_v4();
    let created = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path(format!("/ais/category/{parent}")))
        .and(body_partial_json(json!({
            "categories": [{ "name": "Scripts", "type_default": -1 }]
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "_created_categories": [created],
            "category_id": created,
            "parent_id": parent,
            "name": "Scripts",
            "version": 1
        })))
        .mount(&server)
        .await;

    let client = InventoryClient::with_base_url(&server.uri(), "test-token").unwrap();
    let delta = client
        .create_category(parent, "Scripts", FolderType::Plain)
        .await
        .unwrap();

    assert_eq!(delta["category_id"], json!(created));
}

#[tokio::test]
async fn remove_with_no_content_is_empty_delta() {
    let server = MockServer::start().await;
    let item = Uuid::new_v4();

    Mock::given(method("DELETE"))
        .and(path(format!("/ais/item/{item}")))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = InventoryClient::with_base_url(&server.uri(), "test-token").unwrap();
    let delta = client.remove_item(item).await.unwrap();

    assert!(delta.as_object().unwrap().is_empty());
}

#[tokio::test]
async fn move_item_patches_parent() {
    let server = MockServer::start().await;
    let item = Uuid::new_v4();
    let parent = Uuid::new_v4();

    Mock::given(method("PATCH"))
        .and(path(format!("/ais/item/{item}")))
        .and(body_partial_json(json!({ "parent_id": parent })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_updated_category_versions": { parent.to_string(): 3 }
        })))
        .mount(&server)
        .await;

    let client = InventoryClient::with_base_url(&server.uri(), "test-token").unwrap();
    let delta = client.move_item(item, parent).await.unwrap();

    assert_eq!(delta["_updated_category_versions"][parent.to_string()], 3);
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/cap/FetchInventory2"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;

    let client = InventoryClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .fetch_items(Destination::Primary, Uuid::nil(), &[])
        .await
        .unwrap_err();

    assert_eq!(err.classification(), Some(ApiErrorClass::Transient));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn malformed_body_is_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/cap/FetchInventoryDescendents2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let client = InventoryClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .fetch_descendents(Destination::Primary, &[])
        .await
        .unwrap_err();

    assert!(matches!(err, InventoryApiError::MalformedBody(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn not_found_is_permanent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/cap/FetchInventoryDescendents2"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = InventoryClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .fetch_descendents(Destination::Primary, &[])
        .await
        .unwrap_err();

    assert_eq!(err.classification(), Some(ApiErrorClass::Permanent));
    assert!(!err.is_retryable());
}
