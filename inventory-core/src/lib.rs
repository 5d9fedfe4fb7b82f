mod client;
mod patch;
mod types;
mod wire;

pub use client::{ApiErrorClass, Destination, InventoryApiError, InventoryClient};
pub use patch::{CategoryPatch, ItemPatch, PayloadError};
pub use types::{
    AssetType, DESCENDANT_COUNT_UNKNOWN, FolderType, InventoryCategory, InventoryItem,
    InventoryObject, InventoryType, ObjectRef, Permissions, SaleInfo, SaleType, UnknownCode,
    VERSION_UNKNOWN,
};
pub use wire::{
    BadFolder, FetchDescendentsResponse, FetchItemsResponse, FolderContents, FolderRequest,
    ItemRequest,
};
