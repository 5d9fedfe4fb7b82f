use inventory_core::{
    AssetType, FolderType, InventoryCategory, InventoryItem, InventoryType, Permissions, SaleInfo,
};
use serde_json::{Value, json};
use time::OffsetDateTime;
use uuid::Uuid;

pub fn category(parent: Uuid, name: &str) -> InventoryCategory {
    InventoryCategory::new(Uuid::new_v4(), parent, name, FolderType::Plain, Uuid::nil())
}

pub fn complete_category(parent: Uuid, name: &str, version: i32, declared: i32) -> InventoryCategory {
    let mut cat = category(parent, name);
    cat.version = version;
    cat.declared_descendants = declared;
    cat
}

pub fn item(parent: Uuid, name: &str) -> InventoryItem {
    InventoryItem {
        item_id: Uuid::new_v4(),
        parent_id: parent,
        name: name.to_string(),
        desc: String::new(),
        asset_id: Uuid::new_v4(),
        asset_type: AssetType::Object,
        inv_type: InventoryType::Object,
        flags: 0,
        permissions: Permissions::default(),
        sale_info: SaleInfo::default(),
        created_at: OffsetDateTime::UNIX_EPOCH,
        complete: true,
    }
}

pub fn link(parent: Uuid, target: Uuid, kind: AssetType) -> InventoryItem {
    let mut link = item(parent, "link");
    link.asset_type = kind;
    link.asset_id = target;
    link
}

pub fn item_json(id: Uuid, parent: Uuid, name: &str) -> Value {
    json!({
        "item_id": id,
        "parent_id": parent,
        "name": name,
        "type": 6,
        "inv_type": 6,
        "created_at": 1_700_000_000,
        "permissions": { "owner_mask": 0x7fff_ffff_u32 }
    })
}

pub fn category_json(id: Uuid, parent: Uuid, name: &str) -> Value {
    json!({
        "category_id": id,
        "parent_id": parent,
        "name": name,
        "type_default": -1
    })
}
