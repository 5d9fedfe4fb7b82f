use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::types::FolderType;
use crate::wire::{
    FetchDescendentsRequest, FetchDescendentsResponse, FetchItemsRequest, FetchItemsResponse,
    FolderRequest, ItemRequest,
};

#[derive(Debug, Error)]
pub enum InventoryApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed response body: {0}")]
    MalformedBody(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Which back-end serves a request: the user's own store or the shared read-only library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Primary,
    Library,
}

impl Destination {
    fn descendents_endpoint(self) -> &'static str {
        match self {
            Destination::Primary => "FetchInventoryDescendents2",
            Destination::Library => "FetchLibDescendents2",
        }
    }

    fn items_endpoint(self) -> &'static str {
        match self {
            Destination::Primary => "FetchInventory2",
            Destination::Library => "FetchLib2",
        }
    }
}

#[derive(Clone)]
pub struct InventoryClient {
    http: Client,
    caps_url: Url,
    ais_url: Url,
    token: String,
}

impl InventoryClient {
    pub fn new(
        caps_url: &str,
        ais_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, InventoryApiError> {
        Ok(Self {
            http: Client::new(),
            caps_url: directory_url(caps_url)?,
            ais_url: directory_url(ais_url)?,
            token: token.into(),
        })
    }

    /// Serves both capability and command endpoints from one host, under `/cap/` and `/ais/`.
    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, InventoryApiError> {
        let base = base_url.trim_end_matches('/');
        Self::new(&format!("{base}/cap/"), &format!("{base}/ais/"), token)
    }

    pub async fn fetch_descendents(
        &self,
        destination: Destination,
        folders: &[FolderRequest],
    ) -> Result<FetchDescendentsResponse, InventoryApiError> {
        let url = self.caps_url.join(destination.descendents_endpoint())?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&FetchDescendentsRequest { folders })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn fetch_items(
        &self,
        destination: Destination,
        agent_id: Uuid,
        items: &[ItemRequest],
    ) -> Result<FetchItemsResponse, InventoryApiError> {
        let url = self.caps_url.join(destination.items_endpoint())?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&FetchItemsRequest { agent_id, items })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_category(
        &self,
        parent_id: Uuid,
        name: &str,
        preferred_type: FolderType,
    ) -> Result<Value, InventoryApiError> {
        let url = self.ais_url.join(&format!("category/{parent_id}"))?;
        let body = json!({
            "categories": [{
                "name": name,
                "type_default": preferred_type.code(),
                "parent_id": parent_id,
            }]
        });
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&body)
            .send()
            .await?;
        Self::handle_delta(response).await
    }

    pub async fn move_item(&self, item_id: Uuid, parent_id: Uuid) -> Result<Value, InventoryApiError> {
        self.patch_parent("item", item_id, parent_id).await
    }

    pub async fn move_category(
        &self,
        category_id: Uuid,
        parent_id: Uuid,
    ) -> Result<Value, InventoryApiError> {
        self.patch_parent("category", category_id, parent_id).await
    }

    pub async fn remove_item(&self, item_id: Uuid) -> Result<Value, InventoryApiError> {
        self.delete_object("item", item_id).await
    }

    pub async fn remove_category(&self, category_id: Uuid) -> Result<Value, InventoryApiError> {
        self.delete_object("category", category_id).await
    }

    async fn patch_parent(
        &self,
        kind: &str,
        id: Uuid,
        parent_id: Uuid,
    ) -> Result<Value, InventoryApiError> {
        let url = self.ais_url.join(&format!("{kind}/{id}"))?;
        let response = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .json(&json!({ "parent_id": parent_id }))
            .send()
            .await?;
        Self::handle_delta(response).await
    }

    async fn delete_object(&self, kind: &str, id: Uuid) -> Result<Value, InventoryApiError> {
        let url = self.ais_url.join(&format!("{kind}/{id}"))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_delta(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, InventoryApiError> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            Ok(serde_json::from_str(&body)?)
        } else {
            Err(InventoryApiError::Api { status, body })
        }
    }

    /// Command responses may legitimately be empty (204); that is an empty delta.
    async fn handle_delta(response: reqwest::Response) -> Result<Value, InventoryApiError> {
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Value::Object(Default::default()));
        }
        Self::handle_response(response).await
    }
}

fn directory_url(value: &str) -> Result<Url, url::ParseError> {
    if value.ends_with('/') {
        Url::parse(value)
    } else {
        Url::parse(&format!("{value}/"))
    }
}

impl InventoryApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            InventoryApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    /// Transport failures and garbled bodies are worth another attempt; so are
    /// throttling and server-side hiccups.
    pub fn is_retryable(&self) -> bool {
        match self {
            InventoryApiError::Request(_) | InventoryApiError::MalformedBody(_) => true,
            InventoryApiError::Url(_) => false,
            InventoryApiError::Api { .. } => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::NOT_FOUND),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn directory_urls_always_end_with_slash() {
        let url = directory_url("https://caps.example/agent/42").unwrap();
        assert_eq!(
            url.join("FetchInventory2").unwrap().as_str(),
            "https://caps.example/agent/42/FetchInventory2"
        );
    }
}
