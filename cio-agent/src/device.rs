//! Block-device adapter over the CIO backend.
//!
//! Implements the orchestration framework's block-device contract: volumes
//! are CIO vdisks stamped with cluster and dataset tags, attached to compute
//! instances by node name. Attach, detach, and create are asynchronous on
//! the backend, so the adapter polls vdisk state until the transition
//! converges or a deadline passes.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cio::error::CioError;
use crate::cio::tags::VolumeTags;
use crate::cio::vdisk::{CioManager, Vdisk, VdiskProfile, VdiskStatus};

const GIB: u64 = 1024 * 1024 * 1024;

/// Fixed allocation unit for CIO-backed volumes (8 GiB)
pub const ALLOCATION_UNIT: u64 = 8 * GIB;

/// Default interval between backend state polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default deadline for attach/detach/create transitions
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("unknown volume '{0}'")]
    UnknownVolume(String),

    #[error("volume '{0}' is already attached")]
    AlreadyAttached(String),

    #[error("volume '{0}' is not attached")]
    Unattached(String),

    #[error("volume '{blockdevice_id}' is attached to '{attached_to}', not to '{instance}'")]
    AttachedElsewhere {
        blockdevice_id: String,
        attached_to: String,
        instance: String,
    },

    #[error(
        "volume '{blockdevice_id}' attached at unexpected device: expected '{expected}', discovered '{discovered}'"
    )]
    UnexpectedDevice {
        blockdevice_id: String,
        expected: String,
        discovered: String,
    },

    #[error("timed out waiting for volume '{blockdevice_id}' to finish {operation} after {waited_secs}s")]
    Timeout {
        blockdevice_id: String,
        operation: &'static str,
        waited_secs: u64,
    },

    #[error(transparent)]
    Backend(#[from] CioError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// A volume as seen by the orchestration framework
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceVolume {
    /// Backend identifier of the block device
    pub blockdevice_id: String,
    /// Volume size in bytes
    pub size: u64,
    /// Instance the volume is attached to, if any
    pub attached_to: Option<String>,
    /// Dataset the volume was created for
    pub dataset_id: Uuid,
}

/// Round a requested size up to whole GiB for the backend tool.
/// Zero-sized requests still provision one GiB.
pub fn size_to_gib(size_bytes: u64) -> u64 {
    size_bytes.div_ceil(GIB).max(1)
}

/// Device node CIO assigns to an attached vdisk
pub fn expected_device_path(vdisk_id: &str) -> String {
    format!("/dev/vdisk/{}", vdisk_id)
}

/// Block-device API backed by a CIO storage cluster
pub struct CioBlockDeviceApi {
    /// Backend CLI wrapper
    cio: CioManager,
    /// Cluster whose volumes this agent manages
    cluster_id: Uuid,
    /// Identity of the local compute instance
    instance_id: String,
    /// Provisioning parameters for new vdisks
    profile: VdiskProfile,
    /// Interval between state polls
    poll_interval: Duration,
    /// Deadline for state transitions
    op_timeout: Duration,
}

impl CioBlockDeviceApi {
    pub fn new(cio: CioManager, cluster_id: Uuid, instance_id: String, profile: VdiskProfile) -> Self {
        Self {
            cio,
            cluster_id,
            instance_id,
            profile,
            poll_interval: DEFAULT_POLL_INTERVAL,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Override the poll interval and transition deadline
    pub fn with_timeouts(mut self, poll_interval: Duration, op_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.op_timeout = op_timeout;
        self
    }

    /// Allocation granularity the orchestrator should request sizes in
    pub fn allocation_unit(&self) -> u64 {
        ALLOCATION_UNIT
    }

    /// Identity of the compute instance this agent runs on
    pub fn compute_instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn cluster_id(&self) -> Uuid {
        self.cluster_id
    }

    /// Look up a vdisk and require it to be a member of this cluster.
    ///
    /// Foreign, untagged, and corrupt-tagged vdisks are all reported as
    /// unknown: the block-device API only ever exposes volumes this cluster
    /// owns.
    fn get_cluster_vdisk(&self, blockdevice_id: &str) -> Result<(Vdisk, VolumeTags)> {
        let vdisk = match self.cio.get_vdisk(blockdevice_id) {
            Ok(vdisk) => vdisk,
            Err(CioError::VdiskNotFound(_)) => {
                return Err(DeviceError::UnknownVolume(blockdevice_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        match VolumeTags::from_tags(&vdisk.tags) {
            Ok(Some(tags)) if tags.cluster_id == self.cluster_id => Ok((vdisk, tags)),
            Ok(_) => Err(DeviceError::UnknownVolume(blockdevice_id.to_string())),
            Err(e) => {
                warn!(vdisk = %blockdevice_id, error = %e, "Corrupt volume tags");
                Err(DeviceError::UnknownVolume(blockdevice_id.to_string()))
            }
        }
    }

    fn to_volume(vdisk: &Vdisk, tags: &VolumeTags) -> BlockDeviceVolume {
        BlockDeviceVolume {
            blockdevice_id: vdisk.id.clone(),
            size: vdisk.size_bytes,
            attached_to: vdisk.attached_to.clone(),
            dataset_id: tags.dataset_id,
        }
    }

    /// Poll vdisk state until `done` holds or the deadline passes
    async fn wait_for_state(
        &self,
        blockdevice_id: &str,
        operation: &'static str,
        done: impl Fn(&Vdisk) -> bool,
    ) -> Result<Vdisk> {
        let deadline = tokio::time::Instant::now() + self.op_timeout;

        loop {
            let vdisk = match self.cio.get_vdisk(blockdevice_id) {
                Ok(vdisk) => vdisk,
                Err(CioError::VdiskNotFound(_)) => {
                    return Err(DeviceError::UnknownVolume(blockdevice_id.to_string()));
                }
                Err(e) => return Err(e.into()),
            };

            if vdisk.status == VdiskStatus::Failed {
                return Err(DeviceError::Backend(CioError::CommandFailed(format!(
                    "vdisk '{}' entered failed state during {}",
                    blockdevice_id, operation
                ))));
            }

            if done(&vdisk) {
                return Ok(vdisk);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(DeviceError::Timeout {
                    blockdevice_id: blockdevice_id.to_string(),
                    operation,
                    waited_secs: self.op_timeout.as_secs(),
                });
            }

            debug!(
                vdisk = %blockdevice_id,
                status = %vdisk.status,
                operation,
                "Waiting for vdisk transition"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Best-effort cleanup of a create that could not complete. An orphan
    /// here would be invisible to the cluster but still consume backend
    /// capacity.
    fn rollback_create(&self, blockdevice_id: &str) {
        if let Err(e) = self.cio.destroy_vdisk(blockdevice_id) {
            warn!(vdisk = %blockdevice_id, error = %e, "Rollback destroy failed");
        }
    }

    /// Create a volume for a dataset and stamp it with cluster metadata.
    ///
    /// The vdisk is destroyed again if tagging fails or it never becomes
    /// available, so a retried create cannot leave an untagged orphan.
    #[instrument(skip(self))]
    pub async fn create_volume(&self, dataset_id: Uuid, size: u64) -> Result<BlockDeviceVolume> {
        let size_gib = size_to_gib(size);
        info!(%dataset_id, size, size_gib, "Creating volume");

        let blockdevice_id = self.cio.create_vdisk(size_gib, &self.profile)?;

        let tags = VolumeTags::new(dataset_id, self.cluster_id);
        if let Err(e) = self.cio.set_tags(&blockdevice_id, &tags.to_pairs()) {
            warn!(vdisk = %blockdevice_id, error = %e, "Failed to tag new volume, rolling back");
            self.rollback_create(&blockdevice_id);
            return Err(e.into());
        }

        let vdisk = match self
            .wait_for_state(&blockdevice_id, "create", |v| {
                v.status == VdiskStatus::Available
            })
            .await
        {
            Ok(vdisk) => vdisk,
            Err(e) => {
                warn!(vdisk = %blockdevice_id, error = %e, "Volume never became available, rolling back");
                self.rollback_create(&blockdevice_id);
                return Err(e);
            }
        };

        info!(volume = %blockdevice_id, %dataset_id, "Volume created successfully");
        Ok(Self::to_volume(&vdisk, &tags))
    }

    /// List all volumes that belong to this cluster
    pub fn list_volumes(&self) -> Result<Vec<BlockDeviceVolume>> {
        let mut volumes = Vec::new();

        for vdisk in self.cio.list_vdisks()? {
            match VolumeTags::from_tags(&vdisk.tags) {
                Ok(Some(tags)) if tags.cluster_id == self.cluster_id => {
                    volumes.push(Self::to_volume(&vdisk, &tags));
                }
                // Foreign or untagged vdisks are simply not ours
                Ok(_) => {}
                Err(e) => {
                    warn!(vdisk = %vdisk.id, error = %e, "Corrupt volume tags, skipping");
                }
            }
        }

        debug!(count = volumes.len(), "Listed cluster volumes");
        Ok(volumes)
    }

    /// Attach a volume to a compute instance and wait for the device node.
    #[instrument(skip(self))]
    pub async fn attach_volume(
        &self,
        blockdevice_id: &str,
        attach_to: &str,
    ) -> Result<BlockDeviceVolume> {
        let (vdisk, tags) = self.get_cluster_vdisk(blockdevice_id)?;

        if vdisk.attached_to.is_some() || vdisk.status != VdiskStatus::Available {
            return Err(DeviceError::AlreadyAttached(blockdevice_id.to_string()));
        }

        info!(volume = %blockdevice_id, node = %attach_to, "Attaching volume");
        self.cio.attach_vdisk(blockdevice_id, attach_to)?;

        let attached = self
            .wait_for_state(blockdevice_id, "attach", |v| {
                v.status == VdiskStatus::Attached && v.device.is_some()
            })
            .await?;

        // The backend settled on a node we did not ask for. Surfacing this
        // beats handing the orchestrator a volume it cannot find locally.
        if attached.attached_to.as_deref() != Some(attach_to) {
            return Err(DeviceError::AttachedElsewhere {
                blockdevice_id: blockdevice_id.to_string(),
                attached_to: attached.attached_to.clone().unwrap_or_else(|| "-".to_string()),
                instance: attach_to.to_string(),
            });
        }

        // CIO assigns device nodes deterministically from the vdisk id. A
        // deviating node means the assignment rules are not what this
        // adapter understands; refuse rather than report a wrong path.
        if attach_to == self.instance_id {
            let expected = expected_device_path(blockdevice_id);
            if let Some(discovered) = attached.device.as_deref()
                && discovered != expected
            {
                return Err(DeviceError::UnexpectedDevice {
                    blockdevice_id: blockdevice_id.to_string(),
                    expected,
                    discovered: discovered.to_string(),
                });
            }
        }

        info!(
            volume = %blockdevice_id,
            node = %attach_to,
            device = attached.device.as_deref().unwrap_or("-"),
            "Volume attached successfully"
        );
        Ok(Self::to_volume(&attached, &tags))
    }

    /// Detach a volume from its current compute instance.
    #[instrument(skip(self))]
    pub async fn detach_volume(&self, blockdevice_id: &str) -> Result<()> {
        let (vdisk, _tags) = self.get_cluster_vdisk(blockdevice_id)?;

        if !vdisk.status.in_use() {
            return Err(DeviceError::Unattached(blockdevice_id.to_string()));
        }

        info!(volume = %blockdevice_id, "Detaching volume");
        self.cio.detach_vdisk(blockdevice_id)?;

        self.wait_for_state(blockdevice_id, "detach", |v| {
            v.status == VdiskStatus::Available && v.attached_to.is_none()
        })
        .await?;

        info!(volume = %blockdevice_id, "Volume detached successfully");
        Ok(())
    }

    /// Destroy a cluster volume.
    ///
    /// A volume that never existed for this cluster is an error; a destroy
    /// racing another destroy of the same volume is not.
    #[instrument(skip(self))]
    pub async fn destroy_volume(&self, blockdevice_id: &str) -> Result<()> {
        self.get_cluster_vdisk(blockdevice_id)?;

        self.cio.destroy_vdisk(blockdevice_id)?;

        info!(volume = %blockdevice_id, "Volume destroyed successfully");
        Ok(())
    }

    /// Resolve the local OS device node for an attached volume.
    pub fn get_device_path(&self, blockdevice_id: &str) -> Result<String> {
        let (vdisk, _tags) = self.get_cluster_vdisk(blockdevice_id)?;

        let Some(node) = vdisk.attached_to.as_deref() else {
            return Err(DeviceError::Unattached(blockdevice_id.to_string()));
        };

        if node != self.instance_id {
            return Err(DeviceError::AttachedElsewhere {
                blockdevice_id: blockdevice_id.to_string(),
                attached_to: node.to_string(),
                instance: self.instance_id.clone(),
            });
        }

        let expected = expected_device_path(blockdevice_id);
        match vdisk.device {
            Some(discovered) if discovered == expected => Ok(discovered),
            Some(discovered) => Err(DeviceError::UnexpectedDevice {
                blockdevice_id: blockdevice_id.to_string(),
                expected,
                discovered,
            }),
            // Attached per the backend but no device node reported yet
            None => Err(DeviceError::Unattached(blockdevice_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_size_to_gib_rounds_up() {
        assert_eq!(size_to_gib(0), 1);
        assert_eq!(size_to_gib(1), 1);
        assert_eq!(size_to_gib(GIB), 1);
        assert_eq!(size_to_gib(GIB + 1), 2);
        assert_eq!(size_to_gib(ALLOCATION_UNIT), 8);
        assert_eq!(size_to_gib(ALLOCATION_UNIT + 1), 9);
    }

    #[test]
    fn test_allocation_unit_is_whole_gib() {
        assert_eq!(ALLOCATION_UNIT % GIB, 0);
        assert_eq!(ALLOCATION_UNIT / GIB, 8);
    }

    #[test]
    fn test_expected_device_path() {
        assert_eq!(expected_device_path("vd12"), "/dev/vdisk/vd12");
    }

    #[test]
    fn test_to_volume_conversion() {
        let dataset_id = Uuid::new_v4();
        let cluster_id = Uuid::new_v4();
        let vdisk = Vdisk {
            id: "vd3".to_string(),
            size_bytes: ALLOCATION_UNIT,
            status: VdiskStatus::Attached,
            attached_to: Some("i-0abc".to_string()),
            device: Some("/dev/vdisk/vd3".to_string()),
            tags: HashMap::new(),
        };
        let tags = VolumeTags::new(dataset_id, cluster_id);

        let volume = CioBlockDeviceApi::to_volume(&vdisk, &tags);
        assert_eq!(volume.blockdevice_id, "vd3");
        assert_eq!(volume.size, ALLOCATION_UNIT);
        assert_eq!(volume.attached_to.as_deref(), Some("i-0abc"));
        assert_eq!(volume.dataset_id, dataset_id);
    }

    #[test]
    fn test_device_error_display() {
        let err = DeviceError::UnexpectedDevice {
            blockdevice_id: "vd1".to_string(),
            expected: "/dev/vdisk/vd1".to_string(),
            discovered: "/dev/vdisk/vd9".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/dev/vdisk/vd1"));
        assert!(msg.contains("/dev/vdisk/vd9"));

        let err = DeviceError::AttachedElsewhere {
            blockdevice_id: "vd1".to_string(),
            attached_to: "i-0aaa".to_string(),
            instance: "i-0bbb".to_string(),
        };
        assert!(err.to_string().contains("i-0aaa"));
    }
}
