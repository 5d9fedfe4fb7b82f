//! Partial object descriptions as they arrive from the remote service.
//!
//! A patch carries only the fields the server chose to send. Applied on top of
//! an existing object it copies every absent field forward; applied to nothing
//! it must be able to describe a whole object or it is rejected.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::{
    AssetType, DESCENDANT_COUNT_UNKNOWN, FolderType, InventoryCategory, InventoryItem,
    InventoryType, Permissions, SaleInfo, UnknownCode, VERSION_UNKNOWN,
};

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed object: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("object {id} is missing required field `{field}`")]
    MissingField { id: Uuid, field: &'static str },
    #[error("object {id}: {source}")]
    UnknownType {
        id: Uuid,
        #[source]
        source: UnknownCode,
    },
    #[error("object {id} has invalid creation timestamp {value}")]
    InvalidTimestamp { id: Uuid, value: i64 },
}

impl PayloadError {
    pub fn object_id(&self) -> Option<Uuid> {
        match self {
            PayloadError::Malformed(_) => None,
            PayloadError::MissingField { id, .. }
            | PayloadError::UnknownType { id, .. }
            | PayloadError::InvalidTimestamp { id, .. } => Some(*id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemPatch {
    pub item_id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub asset_id: Option<Uuid>,
    #[serde(default)]
    pub linked_id: Option<Uuid>,
    #[serde(rename = "type", default)]
    pub asset_type: Option<i32>,
    #[serde(default)]
    pub inv_type: Option<i32>,
    #[serde(default)]
    pub flags: Option<u32>,
    #[serde(default)]
    pub permissions: Option<Permissions>,
    #[serde(default)]
    pub sale_info: Option<SaleInfo>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl ItemPatch {
    pub fn from_value(value: &Value) -> Result<Self, PayloadError> {
        Ok(Self::deserialize(value)?)
    }

    /// Merges the patch over `existing`, or builds a new item when there is none.
    pub fn apply(self, existing: Option<&InventoryItem>) -> Result<InventoryItem, PayloadError> {
        let id = self.item_id;
        let asset_type = match self.asset_type {
            Some(code) => Some(
                AssetType::try_from(code)
                    .map_err(|source| PayloadError::UnknownType { id, source })?,
            ),
            None => None,
        };
        let inv_type = match self.inv_type {
            Some(code) => Some(
                InventoryType::try_from(code)
                    .map_err(|source| PayloadError::UnknownType { id, source })?,
            ),
            None => None,
        };
        let created_at = match self.created_at {
            Some(value) => Some(
                OffsetDateTime::from_unix_timestamp(value)
                    .map_err(|_| PayloadError::InvalidTimestamp { id, value })?,
            ),
            None => None,
        };
        let asset_id = self.linked_id.or(self.asset_id);
        let has_full_metadata = self.permissions.is_some();

        match existing {
            Some(current) => Ok(InventoryItem {
                item_id: id,
                parent_id: self.parent_id.unwrap_or(current.parent_id),
                name: self.name.unwrap_or_else(|| current.name.clone()),
                desc: self.desc.unwrap_or_else(|| current.desc.clone()),
                asset_id: asset_id.unwrap_or(current.asset_id),
                asset_type: asset_type.unwrap_or(current.asset_type),
                inv_type: inv_type.unwrap_or(current.inv_type),
                flags: self.flags.unwrap_or(current.flags),
                permissions: self
                    .permissions
                    .unwrap_or_else(|| current.permissions.clone()),
                sale_info: self.sale_info.unwrap_or_else(|| current.sale_info.clone()),
                created_at: created_at.unwrap_or(current.created_at),
                complete: current.complete || has_full_metadata,
            }),
            None => Ok(InventoryItem {
                item_id: id,
                parent_id: self.parent_id.ok_or(PayloadError::MissingField {
                    id,
                    field: "parent_id",
                })?,
                name: self
                    .name
                    .ok_or(PayloadError::MissingField { id, field: "name" })?,
                desc: self.desc.unwrap_or_default(),
                asset_id: asset_id.unwrap_or_default(),
                asset_type: asset_type.ok_or(PayloadError::MissingField { id, field: "type" })?,
                inv_type: inv_type.unwrap_or(InventoryType::Unspecified),
                flags: self.flags.unwrap_or_default(),
                permissions: self.permissions.unwrap_or_default(),
                sale_info: self.sale_info.unwrap_or_default(),
                created_at: created_at.unwrap_or(OffsetDateTime::UNIX_EPOCH),
                complete: has_full_metadata,
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryPatch {
    pub category_id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub type_default: Option<i32>,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    #[serde(default)]
    pub version: Option<i32>,
    #[serde(default)]
    pub descendents: Option<i32>,
}

impl CategoryPatch {
    pub fn from_value(value: &Value) -> Result<Self, PayloadError> {
        Ok(Self::deserialize(value)?)
    }

    /// Version and declared count of an existing folder are local bookkeeping
    /// and are never overwritten from a patch; callers read `version` and
    /// `descendents` off the patch themselves.
    pub fn apply(
        &self,
        existing: Option<&InventoryCategory>,
    ) -> Result<InventoryCategory, PayloadError> {
        let id = self.category_id;
        let preferred_type = match self.type_default {
            Some(code) => Some(
                FolderType::try_from(code)
                    .map_err(|source| PayloadError::UnknownType { id, source })?,
            ),
            None => None,
        };

        match existing {
            Some(current) => Ok(InventoryCategory {
                category_id: id,
                parent_id: self.parent_id.unwrap_or(current.parent_id),
                name: self.name.clone().unwrap_or_else(|| current.name.clone()),
                preferred_type: preferred_type.unwrap_or(current.preferred_type),
                owner_id: self.agent_id.unwrap_or(current.owner_id),
                version: current.version,
                declared_descendants: current.declared_descendants,
                stale: current.stale,
            }),
            None => Ok(InventoryCategory {
                category_id: id,
                parent_id: self.parent_id.ok_or(PayloadError::MissingField {
                    id,
                    field: "parent_id",
                })?,
                name: self
                    .name
                    .clone()
                    .ok_or(PayloadError::MissingField { id, field: "name" })?,
                preferred_type: preferred_type.unwrap_or_default(),
                owner_id: self.agent_id.unwrap_or_default(),
                version: self.version.unwrap_or(VERSION_UNKNOWN),
                declared_descendants: self.descendents.unwrap_or(DESCENDANT_COUNT_UNKNOWN),
                stale: false,
            }),
        }
    }
}
