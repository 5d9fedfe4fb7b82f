use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Version of a folder whose contents were never fetched.
pub const VERSION_UNKNOWN: i32 = -1;
/// Declared descendant count of a folder whose contents were never fetched.
pub const DESCENDANT_COUNT_UNKNOWN: i32 = -1;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("unknown {kind} code: {code}")]
pub struct UnknownCode {
    pub kind: &'static str,
    pub code: i32,
}

macro_rules! coded_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $($variant:ident = $code:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "i32", into = "i32")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn code(self) -> i32 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl TryFrom<i32> for $name {
            type Error = UnknownCode;

            fn try_from(code: i32) -> Result<Self, Self::Error> {
                Self::from_code(code).ok_or(UnknownCode { kind: $label, code })
            }
        }

        impl From<$name> for i32 {
            fn from(value: $name) -> i32 {
                value.code()
            }
        }
    };
}

coded_enum! {
    /// Content type of an item's payload.
    AssetType, "asset type" {
        Texture = 0,
        Sound = 1,
        CallingCard = 2,
        Landmark = 3,
        Clothing = 5,
        Object = 6,
        Notecard = 7,
        Category = 8,
        LslText = 10,
        LslBytecode = 11,
        BodyPart = 13,
        Animation = 20,
        Gesture = 21,
        Link = 24,
        LinkFolder = 25,
        Mesh = 49,
        Settings = 56,
        Material = 57,
    }
}

coded_enum! {
    /// How an item is presented to the user.
    InventoryType, "inventory type" {
        Unspecified = -1,
        Texture = 0,
        Sound = 1,
        CallingCard = 2,
        Landmark = 3,
        Object = 6,
        Notecard = 7,
        Category = 8,
        RootCategory = 9,
        Script = 10,
        Snapshot = 15,
        Attachment = 17,
        Wearable = 18,
        Animation = 19,
        Gesture = 20,
        Mesh = 22,
        Settings = 25,
        Material = 26,
    }
}

coded_enum! {
    /// Marks a folder as the canonical container for one kind of content.
    FolderType, "folder type" {
        Plain = -1,
        Texture = 0,
        Sound = 1,
        CallingCard = 2,
        Landmark = 3,
        Clothing = 5,
        Object = 6,
        Notecard = 7,
        RootInventory = 8,
        LslText = 10,
        BodyPart = 13,
        Trash = 14,
        Snapshot = 15,
        LostAndFound = 16,
        Animation = 20,
        Gesture = 21,
        Favorite = 23,
        CurrentOutfit = 46,
        Outfit = 47,
        MyOutfits = 48,
        Mesh = 49,
        Inbox = 50,
        Outbox = 51,
        BasicRoot = 52,
        MarketplaceListings = 53,
        MarketplaceStock = 54,
        MarketplaceVersion = 55,
        Settings = 56,
        Material = 57,
    }
}

impl AssetType {
    pub fn is_link(self) -> bool {
        matches!(self, AssetType::Link | AssetType::LinkFolder)
    }
}

impl Default for FolderType {
    fn default() -> Self {
        FolderType::Plain
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub creator_id: Uuid,
    pub owner_id: Uuid,
    pub last_owner_id: Uuid,
    pub group_id: Uuid,
    pub is_owner_group: bool,
    pub base_mask: u32,
    pub owner_mask: u32,
    pub group_mask: u32,
    pub everyone_mask: u32,
    pub next_owner_mask: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleType {
    #[default]
    #[serde(rename = "not")]
    NotForSale,
    #[serde(rename = "orig")]
    Original,
    #[serde(rename = "copy")]
    Copy,
    #[serde(rename = "cntn")]
    Contents,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaleInfo {
    pub sale_type: SaleType,
    pub sale_price: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub item_id: Uuid,
    pub parent_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    /// Payload reference; for links, the id of the linked object.
    #[serde(default)]
    pub asset_id: Uuid,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    pub inv_type: InventoryType,
    /// Low byte carries the sub-type.
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub sale_info: SaleInfo,
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(default = "complete_by_default")]
    pub complete: bool,
}

fn complete_by_default() -> bool {
    true
}

impl InventoryItem {
    pub fn is_link(&self) -> bool {
        self.asset_type.is_link()
    }

    pub fn linked_id(&self) -> Option<Uuid> {
        self.is_link().then_some(self.asset_id)
    }

    pub fn sub_type(&self) -> u8 {
        (self.flags & 0xff) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryCategory {
    pub category_id: Uuid,
    pub parent_id: Uuid,
    pub name: String,
    #[serde(rename = "type_default", default)]
    pub preferred_type: FolderType,
    #[serde(rename = "agent_id", default)]
    pub owner_id: Uuid,
    #[serde(default = "unknown", skip_serializing_if = "is_unknown")]
    pub version: i32,
    #[serde(
        rename = "descendents",
        default = "unknown",
        skip_serializing_if = "is_unknown"
    )]
    pub declared_descendants: i32,
    /// Set when local bookkeeping could not be trusted; cleared by an authoritative listing.
    #[serde(skip)]
    pub stale: bool,
}

fn unknown() -> i32 {
    VERSION_UNKNOWN
}

fn is_unknown(value: &i32) -> bool {
    *value == VERSION_UNKNOWN
}

impl InventoryCategory {
    pub fn new(
        category_id: Uuid,
        parent_id: Uuid,
        name: impl Into<String>,
        preferred_type: FolderType,
        owner_id: Uuid,
    ) -> Self {
        Self {
            category_id,
            parent_id,
            name: name.into(),
            preferred_type,
            owner_id,
            version: VERSION_UNKNOWN,
            declared_descendants: DESCENDANT_COUNT_UNKNOWN,
            stale: false,
        }
    }

    pub fn version_known(&self) -> bool {
        self.version != VERSION_UNKNOWN
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InventoryObject {
    Category(InventoryCategory),
    Item(InventoryItem),
}

impl InventoryObject {
    pub fn id(&self) -> Uuid {
        self.as_ref().id()
    }

    pub fn parent_id(&self) -> Uuid {
        self.as_ref().parent_id()
    }

    pub fn name(&self) -> &str {
        match self {
            InventoryObject::Category(cat) => &cat.name,
            InventoryObject::Item(item) => &item.name,
        }
    }

    pub fn as_ref(&self) -> ObjectRef<'_> {
        match self {
            InventoryObject::Category(cat) => ObjectRef::Category(cat),
            InventoryObject::Item(item) => ObjectRef::Item(item),
        }
    }
}

impl From<InventoryCategory> for InventoryObject {
    fn from(value: InventoryCategory) -> Self {
        InventoryObject::Category(value)
    }
}

impl From<InventoryItem> for InventoryObject {
    fn from(value: InventoryItem) -> Self {
        InventoryObject::Item(value)
    }
}

/// Borrowed view of a stored object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObjectRef<'a> {
    Category(&'a InventoryCategory),
    Item(&'a InventoryItem),
}

impl<'a> ObjectRef<'a> {
    pub fn id(&self) -> Uuid {
        match self {
            ObjectRef::Category(cat) => cat.category_id,
            ObjectRef::Item(item) => item.item_id,
        }
    }

    pub fn parent_id(&self) -> Uuid {
        match self {
            ObjectRef::Category(cat) => cat.parent_id,
            ObjectRef::Item(item) => item.parent_id,
        }
    }

    pub fn name(&self) -> &'a str {
        match self {
            ObjectRef::Category(cat) => &cat.name,
            ObjectRef::Item(item) => &item.name,
        }
    }

    pub fn is_category(&self) -> bool {
        matches!(self, ObjectRef::Category(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_round_trip_through_integers() {
        assert_eq!(AssetType::from_code(24), Some(AssetType::Link));
        assert_eq!(i32::from(FolderType::LostAndFound), 16);
        assert_eq!(InventoryType::try_from(-1), Ok(InventoryType::Unspecified));
        assert_eq!(
            AssetType::try_from(4),
            Err(UnknownCode {
                kind: "asset type",
                code: 4
            })
        );
    }

    #[test]
    fn category_serialization_omits_unknown_counters() {
        let cat = InventoryCategory::new(
            Uuid::new_v4(),
            Uuid::nil(),
            "Objects",
            FolderType::Object,
            Uuid::nil(),
        );
        let value = serde_json::to_value(&cat).unwrap();
        assert!(value.get("version").is_none());
        assert!(value.get("descendents").is_none());
        assert_eq!(value["type_default"], 6);
    }

    #[test]
    fn unknown_folder_type_fails_to_deserialize() {
        let value = serde_json::json!({
            "category_id": Uuid::new_v4(),
            "parent_id": Uuid::nil(),
            "name": "Odd",
            "type_default": 999,
        });
        assert!(serde_json::from_value::<InventoryCategory>(value).is_err());
    }

    #[test]
    fn link_exposes_target_id() {
        let target = Uuid::new_v4();
        let item = InventoryItem {
            item_id: Uuid::new_v4(),
            parent_id: Uuid::new_v4(),
            name: "shortcut".into(),
            desc: String::new(),
            asset_id: target,
            asset_type: AssetType::Link,
            inv_type: InventoryType::Object,
            flags: 0x0102,
            permissions: Permissions::default(),
            sale_info: SaleInfo::default(),
            created_at: OffsetDateTime::UNIX_EPOCH,
            complete: true,
        };
        assert_eq!(item.linked_id(), Some(target));
        assert_eq!(item.sub_type(), 2);
    }
}
