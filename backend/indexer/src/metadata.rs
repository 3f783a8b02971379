//! Project metadata resolution for registry `metaURI` values.

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{IndexerError, Result};

/// Name used when the metadata document cannot be fetched at all.
pub const UNAVAILABLE_NAME: &str = "Unnamed Project (Metadata Failed)";

const DATA_JSON_BASE64: &str = "data:application/json;base64,";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub name: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

impl ProjectMetadata {
    pub fn unavailable() -> Self {
        Self {
            name: UNAVAILABLE_NAME.to_string(),
            description: None,
            image_url: None,
        }
    }

    /// Name derived from the URI itself, for documents without one.
    pub fn placeholder_name(uri: &str) -> String {
        let prefix: String = uri.chars().take(20).collect();
        format!("Project from {prefix}...")
    }
}

/// Turns a metadata URI into a name/description/image triple.
///
/// Resolution never fails: errors degrade to [`ProjectMetadata::unavailable`].
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, uri: &str) -> ProjectMetadata;
}

/// JSON document shape published behind a `metaURI`.
#[derive(Debug, Deserialize)]
struct MetadataDocument {
    name: Option<String>,
    description: Option<String>,
    image: Option<String>,
}

impl MetadataDocument {
    fn into_metadata(self, uri: &str) -> ProjectMetadata {
        ProjectMetadata {
            name: self
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| ProjectMetadata::placeholder_name(uri)),
            description: self.description,
            image_url: self.image,
        }
    }
}

/// Fetches `ipfs://` (through a gateway), `http(s)://` and inline
/// base64 `data:` JSON documents.
pub struct HttpMetadataResolver {
    client: Client,
    ipfs_gateway: String,
}

impl HttpMetadataResolver {
    pub fn new(client: Client, ipfs_gateway: impl Into<String>) -> Self {
        let mut ipfs_gateway = ipfs_gateway.into();
        if !ipfs_gateway.ends_with('/') {
            ipfs_gateway.push('/');
        }
        Self {
            client,
            ipfs_gateway,
        }
    }

    fn http_url(&self, uri: &str) -> Result<String> {
        if let Some(path) = uri.strip_prefix("ipfs://") {
            let path = path.strip_prefix("ipfs/").unwrap_or(path);
            return Ok(format!("{}{path}", self.ipfs_gateway));
        }
        if uri.starts_with("https://") || uri.starts_with("http://") {
            return Ok(uri.to_string());
        }
        Err(IndexerError::Metadata(format!("unsupported metadata URI {uri}")))
    }

    async fn fetch(&self, uri: &str) -> Result<ProjectMetadata> {
        let document: MetadataDocument = match uri.strip_prefix(DATA_JSON_BASE64) {
            Some(payload) => {
                let raw = BASE64_STANDARD
                    .decode(payload)
                    .map_err(|e| IndexerError::Metadata(format!("bad base64 payload: {e}")))?;
                serde_json::from_slice(&raw)?
            }
            None => {
                let url = self.http_url(uri)?;
                debug!(%url, "Fetching project metadata");
                self.client
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?
            }
        };
        Ok(document.into_metadata(uri))
    }
}

#[async_trait]
impl MetadataResolver for HttpMetadataResolver {
    async fn resolve(&self, uri: &str) -> ProjectMetadata {
        match self.fetch(uri).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(uri, "Failed to resolve project metadata: {e}");
                ProjectMetadata::unavailable()
            }
        }
    }
}
