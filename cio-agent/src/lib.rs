//! CIO Block-Device Agent Library
//!
//! This library adapts a CIO block-storage cluster to an orchestration
//! framework's block-device contract: volumes are created per dataset,
//! tagged with cluster membership, and attached to compute instances.
//!
//! The library is split into several modules:
//! - `cio`: wrapper over the external `cio` command-line tool
//! - `device`: the block-device operations (create/list/attach/detach/destroy)
//! - `metadata`: cloud instance-metadata lookups
//! - `service`: gRPC service implementation
//! - `metrics`: Prometheus metrics collection

pub mod cio;
pub mod device;
pub mod metadata;
pub mod metrics;
pub mod service;

pub use cio::{CioError, CioManager, StorageTier, VdiskProfile};
pub use device::{BlockDeviceVolume, CioBlockDeviceApi, DeviceError};
pub use metadata::{InstanceMetadataClient, MetadataError};
pub use service::{BlockDeviceAgentService, proto};
