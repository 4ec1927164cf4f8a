//! Cloud instance-metadata lookups.
//!
//! Resolves the identity of the local compute instance from the provider's
//! link-local metadata endpoint. The endpoint answers plain text for single
//! keys and JSON for the instance identity document.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Metadata requests go over a link-local hop; anything slow means we are
/// not on a cloud instance at all.
const METADATA_TIMEOUT: Duration = Duration::from_secs(3);

const INSTANCE_ID_PATH: &str = "latest/meta-data/instance-id";
const IDENTITY_DOCUMENT_PATH: &str = "latest/dynamic/instance-identity/document";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("metadata request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metadata endpoint returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("metadata endpoint returned an empty response")]
    Empty,
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Placement details from the instance identity document
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceIdentity {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    #[serde(default)]
    pub region: String,
    #[serde(rename = "availabilityZone", default)]
    pub availability_zone: String,
}

/// Client for the cloud instance-metadata endpoint
pub struct InstanceMetadataClient {
    base_url: String,
    client: reqwest::Client,
}

impl InstanceMetadataClient {
    /// Create a client for the given endpoint (e.g. `http://169.254.169.254`)
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(METADATA_TIMEOUT)
            .timeout(METADATA_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Fetch the instance id for this node
    pub async fn instance_id(&self) -> Result<String> {
        let url = self.url(INSTANCE_ID_PATH);
        debug!(url = %url, "Querying instance metadata");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(MetadataError::Status(response.status()));
        }

        let body = response.text().await?;
        let id = body.trim();
        if id.is_empty() {
            return Err(MetadataError::Empty);
        }

        Ok(id.to_string())
    }

    /// Fetch the full instance identity document (instance id, region, zone)
    pub async fn instance_identity(&self) -> Result<InstanceIdentity> {
        let url = self.url(IDENTITY_DOCUMENT_PATH);
        debug!(url = %url, "Querying instance identity document");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(MetadataError::Status(response.status()));
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building_trims_trailing_slash() {
        let client = InstanceMetadataClient::new("http://169.254.169.254/").unwrap();
        assert_eq!(
            client.url(INSTANCE_ID_PATH),
            "http://169.254.169.254/latest/meta-data/instance-id"
        );

        let client = InstanceMetadataClient::new("http://metadata.internal").unwrap();
        assert_eq!(
            client.url(IDENTITY_DOCUMENT_PATH),
            "http://metadata.internal/latest/dynamic/instance-identity/document"
        );
    }

    #[test]
    fn test_identity_document_deserialize() {
        let json = r#"{
            "instanceId": "i-0abc123def456",
            "region": "us-west-2",
            "availabilityZone": "us-west-2a",
            "imageId": "ami-12345678"
        }"#;

        let identity: InstanceIdentity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.instance_id, "i-0abc123def456");
        assert_eq!(identity.region, "us-west-2");
        assert_eq!(identity.availability_zone, "us-west-2a");
    }

    #[test]
    fn test_identity_document_missing_placement() {
        // Some providers omit placement fields; only the id is required
        let json = r#"{"instanceId": "i-0abc"}"#;
        let identity: InstanceIdentity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.instance_id, "i-0abc");
        assert!(identity.region.is_empty());
        assert!(identity.availability_zone.is_empty());
    }
}
