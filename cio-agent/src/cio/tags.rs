//! Sidecar tag schema for cluster volume metadata.
//!
//! Volumes managed by an agent are stamped with three tags at creation:
//! the metadata-format version, the owning cluster id, and the dataset id
//! the volume was created for. Only vdisks carrying a matching cluster id
//! are visible through the block-device API.

use std::collections::HashMap;

use uuid::Uuid;

use super::error::{CioError, Result};
use super::vdisk::Vdisk;

/// Tag key carrying the dataset UUID
pub const DATASET_ID_LABEL: &str = "cio:dataset-id";
/// Tag key carrying the owning cluster UUID
pub const CLUSTER_ID_LABEL: &str = "cio:cluster-id";
/// Tag key carrying the metadata schema version
pub const METADATA_VERSION_LABEL: &str = "cio:metadata-version";

/// Current metadata schema version
pub const METADATA_VERSION: &str = "1";

/// Parsed cluster metadata for a managed vdisk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeTags {
    /// Dataset the volume was created for
    pub dataset_id: Uuid,
    /// Cluster that owns the volume
    pub cluster_id: Uuid,
}

impl VolumeTags {
    pub fn new(dataset_id: Uuid, cluster_id: Uuid) -> Self {
        Self {
            dataset_id,
            cluster_id,
        }
    }

    /// Tag pairs to stamp on a newly created vdisk
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        vec![
            (
                METADATA_VERSION_LABEL.to_string(),
                METADATA_VERSION.to_string(),
            ),
            (CLUSTER_ID_LABEL.to_string(), self.cluster_id.to_string()),
            (DATASET_ID_LABEL.to_string(), self.dataset_id.to_string()),
        ]
    }

    /// Read the tag schema back from a vdisk's tag map.
    ///
    /// Returns `Ok(None)` for vdisks without a cluster-id label (not managed
    /// by any agent). A present but malformed label set is an error so
    /// callers can log and skip the vdisk.
    pub fn from_tags(tags: &HashMap<String, String>) -> Result<Option<Self>> {
        let Some(cluster_raw) = tags.get(CLUSTER_ID_LABEL) else {
            return Ok(None);
        };

        let cluster_id = Uuid::parse_str(cluster_raw).map_err(|_| {
            CioError::ParseError(format!("malformed cluster id tag: {}", cluster_raw))
        })?;

        let dataset_raw = tags.get(DATASET_ID_LABEL).ok_or_else(|| {
            CioError::ParseError("cluster volume missing dataset id tag".to_string())
        })?;

        let dataset_id = Uuid::parse_str(dataset_raw).map_err(|_| {
            CioError::ParseError(format!("malformed dataset id tag: {}", dataset_raw))
        })?;

        Ok(Some(Self {
            dataset_id,
            cluster_id,
        }))
    }
}

/// Check whether a vdisk belongs to the given cluster
pub fn is_cluster_volume(cluster_id: Uuid, vdisk: &Vdisk) -> bool {
    matches!(
        VolumeTags::from_tags(&vdisk.tags),
        Ok(Some(tags)) if tags.cluster_id == cluster_id
    )
}
