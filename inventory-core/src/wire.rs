use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRequest {
    pub folder_id: Uuid,
    pub owner_id: Uuid,
    pub sort_order: i32,
    pub fetch_folders: bool,
    pub fetch_items: bool,
}

impl FolderRequest {
    pub fn new(folder_id: Uuid, owner_id: Uuid) -> Self {
        Self {
            folder_id,
            owner_id,
            sort_order: 0,
            fetch_folders: true,
            fetch_items: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct FetchDescendentsRequest<'a> {
    pub folders: &'a [FolderRequest],
}

/// One folder's listing. Children stay raw so a single bad entry only costs itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FolderContents {
    pub folder_id: Uuid,
    #[serde(default)]
    pub owner_id: Uuid,
    pub version: i32,
    pub descendents: i32,
    #[serde(default)]
    pub categories: Vec<Value>,
    #[serde(default)]
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BadFolder {
    pub folder_id: Uuid,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FetchDescendentsResponse {
    #[serde(default)]
    pub folders: Vec<FolderContents>,
    #[serde(default)]
    pub bad_folders: Vec<BadFolder>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRequest {
    pub owner_id: Uuid,
    pub item_id: Uuid,
}

#[derive(Debug, Serialize)]
pub(crate) struct FetchItemsRequest<'a> {
    pub agent_id: Uuid,
    pub items: &'a [ItemRequest],
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FetchItemsResponse {
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default)]
    pub bad_items: Vec<Uuid>,
}
