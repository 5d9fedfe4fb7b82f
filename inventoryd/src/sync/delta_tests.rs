use super::*;
use crate::sync::test_support::{category_json, item_json};
use serde_json::json;

#[test]
fn meta_lists_are_collected_once() {
    let folder = Uuid::new_v4();
    let item = Uuid::new_v4();
    let link = Uuid::new_v4();
    let value = json!({
        "_categories_removed": [folder],
        "_category_items_removed": [item],
        "_removed_items": [item, link],
        "_broken_links_removed": ["not-a-uuid"],
        "_updated_category_versions": { folder.to_string(): 7, "bogus": 1 }
    });

    let batch = DeltaBatch::from_update(&value, BatchOrigin::Command);

    assert_eq!(batch.removed_categories, vec![folder]);
    assert_eq!(batch.removed_items, vec![item, link]);
    assert_eq!(batch.updated_versions.get(&folder), Some(&7));
    assert_eq!(batch.updated_versions.len(), 1);
    assert!(batch.failures.is_empty());
}

#[test]
fn top_level_content_is_always_taken() {
    let id = Uuid::new_v4();
    let batch = DeltaBatch::from_update(&item_json(id, Uuid::new_v4(), "Hat"), BatchOrigin::Command);
    assert_eq!(batch.items.len(), 1);
    assert_eq!(batch.items[0].item_id, id);
}

#[test]
fn embedded_content_requires_allow_list() {
    let folder = Uuid::new_v4();
    let wanted = Uuid::new_v4();
    let unwanted = Uuid::new_v4();
    let mut value = category_json(folder, Uuid::nil(), "Folder");
    value["_embedded"] = json!({
        "items": {
            wanted.to_string(): item_json(wanted, folder, "wanted"),
            unwanted.to_string(): item_json(unwanted, folder, "unwanted"),
        }
    });
    value["_created_items"] = json!([wanted]);

    let batch = DeltaBatch::from_update(&value, BatchOrigin::Fetch);

    assert_eq!(batch.categories.len(), 1);
    let ids: Vec<_> = batch.items.iter().map(|p| p.item_id).collect();
    assert_eq!(ids, vec![wanted]);
    assert_eq!(batch.seeded_counts.get(&folder), Some(&2));
}

#[test]
fn nested_embedded_folders_are_walked() {
    let outer = Uuid::new_v4();
    let inner = Uuid::new_v4();
    let leaf = Uuid::new_v4();
    let mut inner_json = category_json(inner, outer, "Inner");
    inner_json["_embedded"] = json!({ "items": [item_json(leaf, inner, "leaf")] });
    let value = json!({
        "_created_categories": [inner],
        "_created_items": [leaf],
        "_embedded": { "categories": [inner_json] }
    });

    let batch = DeltaBatch::from_update(&value, BatchOrigin::Command);

    assert_eq!(batch.categories[0].category_id, inner);
    assert_eq!(batch.items[0].item_id, leaf);
    assert_eq!(batch.seeded_counts.get(&inner), Some(&1));
}

#[test]
fn explicit_descendent_count_is_not_overridden_by_seed() {
    let folder = Uuid::new_v4();
    let mut value = category_json(folder, Uuid::nil(), "Folder");
    value["descendents"] = json!(5);
    value["_embedded"] = json!({ "items": [] });

    let batch = DeltaBatch::from_update(&value, BatchOrigin::Command);

    assert!(batch.seeded_counts.is_empty());
    assert_eq!(batch.categories[0].descendents, Some(5));
}

#[test]
fn duplicates_collapse_to_last_occurrence() {
    let id = Uuid::new_v4();
    let parent = Uuid::new_v4();
    let value = json!({
        "_updated_items": [id],
        "_embedded": {
            "links": [item_json(id, parent, "first")],
            "items": [item_json(id, parent, "second")]
        }
    });

    let batch = DeltaBatch::from_update(&value, BatchOrigin::Fetch);

    assert_eq!(batch.items.len(), 1);
    assert_eq!(batch.items[0].name.as_deref(), Some("second"));
}

#[test]
fn malformed_objects_become_failures() {
    let id = Uuid::new_v4();
    let value = json!({ "item_id": id, "name": 12 });

    let batch = DeltaBatch::from_update(&value, BatchOrigin::Command);

    assert!(batch.items.is_empty());
    assert_eq!(batch.failures.len(), 1);
    assert_eq!(batch.failures[0].object_id, Some(id));
}

#[test]
fn non_object_payload_is_a_failure() {
    let batch = DeltaBatch::from_update(&json!([1, 2]), BatchOrigin::Command);
    assert!(batch.is_empty());
    assert_eq!(batch.failures.len(), 1);
}

#[test]
fn folder_listing_defaults_child_parent_and_counts_entries() {
    let folder = Uuid::new_v4();
    let child = Uuid::new_v4();
    let contents = FolderContents {
        folder_id: folder,
        owner_id: Uuid::nil(),
        version: 3,
        descendents: 3,
        categories: vec![json!({ "category_id": child, "name": "Child" })],
        items: vec![item_json(Uuid::new_v4(), folder, "a"), json!({ "bogus": true })],
    };

    let batch = DeltaBatch::from_folder_listing(&[contents]);

    assert_eq!(batch.kind, BatchKind::FolderListing);
    let listing = &batch.listings[0];
    assert_eq!(listing.categories[0].parent_id, Some(folder));
    assert_eq!(listing.items.len(), 1);
    assert_eq!(listing.listed, 3);
    assert!(listing.is_exhaustive());
    assert_eq!(batch.failures.len(), 1);
}
