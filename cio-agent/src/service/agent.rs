//! gRPC block-device agent service implementation.
//!
//! Thin transport layer over `CioBlockDeviceApi`: request validation,
//! concurrency limiting, metrics, and error mapping.
//!
//! Rate limiting is implemented using a semaphore to prevent overload from
//! concurrent storage operations.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tonic::{Request, Response, Status};
use tracing::{info, warn};
use uuid::Uuid;

use crate::device::{BlockDeviceVolume, CioBlockDeviceApi, DeviceError};
use crate::metrics::{self, OperationTimer};

use super::proto;
use super::proto::block_device_agent_server::BlockDeviceAgent;
use super::proto::{
    AttachVolumeRequest, AttachVolumeResponse, CreateVolumeRequest, CreateVolumeResponse,
    DestroyVolumeRequest, DestroyVolumeResponse, DetachVolumeRequest, DetachVolumeResponse,
    GetAgentInfoRequest, GetAgentInfoResponse, GetDevicePathRequest, GetDevicePathResponse,
    ListVolumesRequest, ListVolumesResponse,
};

/// Default maximum number of concurrent block-device operations
const DEFAULT_MAX_CONCURRENT_OPS: usize = 10;

/// Apply pagination to a list of items
fn paginate<T>(
    items: Vec<T>,
    max_entries: i32,
    starting_token: &str,
) -> Result<(Vec<T>, String), Status> {
    let max_entries = if max_entries > 0 {
        max_entries as usize
    } else {
        items.len()
    };

    let start_idx = if !starting_token.is_empty() {
        starting_token
            .parse::<usize>()
            .map_err(|_| Status::invalid_argument("Invalid starting_token"))?
    } else {
        0
    };

    let total_len = items.len();
    let end_idx = std::cmp::min(start_idx + max_entries, total_len);

    let paginated: Vec<T> = items
        .into_iter()
        .skip(start_idx)
        .take(end_idx - start_idx)
        .collect();

    let next_token = if end_idx < total_len {
        end_idx.to_string()
    } else {
        String::new()
    };

    Ok((paginated, next_token))
}

fn to_proto_volume(volume: &BlockDeviceVolume) -> proto::Volume {
    proto::Volume {
        blockdevice_id: volume.blockdevice_id.clone(),
        size_bytes: volume.size,
        attached_to: volume.attached_to.clone().unwrap_or_default(),
        dataset_id: volume.dataset_id.to_string(),
    }
}

/// Map adapter errors onto gRPC status codes
fn device_error_to_status(err: &DeviceError) -> Status {
    match err {
        DeviceError::UnknownVolume(_) => Status::not_found(err.to_string()),
        DeviceError::AlreadyAttached(_)
        | DeviceError::Unattached(_)
        | DeviceError::AttachedElsewhere { .. } => Status::failed_precondition(err.to_string()),
        DeviceError::Timeout { .. } => Status::deadline_exceeded(err.to_string()),
        DeviceError::UnexpectedDevice { .. } | DeviceError::Backend(_) => {
            Status::internal(err.to_string())
        }
    }
}

/// Short error label for the operation metrics
fn error_label(err: &DeviceError) -> &'static str {
    match err {
        DeviceError::UnknownVolume(_) => "unknown_volume",
        DeviceError::AlreadyAttached(_) => "already_attached",
        DeviceError::Unattached(_) => "unattached",
        DeviceError::AttachedElsewhere { .. } => "attached_elsewhere",
        DeviceError::UnexpectedDevice { .. } => "unexpected_device",
        DeviceError::Timeout { .. } => "timeout",
        DeviceError::Backend(_) => "backend_error",
    }
}

fn parse_dataset_id(raw: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw).map_err(|_| {
        Status::invalid_argument(format!("invalid dataset_id '{}': expected a UUID", raw))
    })
}

fn require_blockdevice_id(raw: &str) -> Result<(), Status> {
    if raw.is_empty() {
        return Err(Status::invalid_argument("blockdevice_id cannot be empty"));
    }
    Ok(())
}

/// gRPC block-device agent service
///
/// Uses a semaphore to limit concurrent operations and prevent overload.
/// When the semaphore is exhausted, new requests will receive
/// ResourceExhausted.
pub struct BlockDeviceAgentService {
    /// Block-device adapter over the CIO backend
    api: Arc<CioBlockDeviceApi>,
    /// Semaphore for rate limiting concurrent operations
    ops_semaphore: Arc<Semaphore>,
    /// Maximum concurrent operations (for error messages)
    max_concurrent_ops: usize,
}

impl BlockDeviceAgentService {
    /// Create a new service with default rate limiting (10 concurrent ops)
    pub fn new(api: Arc<CioBlockDeviceApi>) -> Self {
        Self::with_concurrency_limit(api, DEFAULT_MAX_CONCURRENT_OPS)
    }

    /// Create a new service with configurable concurrency limit
    pub fn with_concurrency_limit(api: Arc<CioBlockDeviceApi>, max_concurrent_ops: usize) -> Self {
        Self {
            api,
            ops_semaphore: Arc::new(Semaphore::new(max_concurrent_ops)),
            max_concurrent_ops,
        }
    }

    /// Acquire rate limiting permit, returning ResourceExhausted if too many concurrent ops
    async fn acquire_permit(
        &self,
        operation: &str,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, Status> {
        match self.ops_semaphore.try_acquire() {
            Ok(permit) => {
                // Track current concurrent operations
                let current_ops = self.max_concurrent_ops - self.ops_semaphore.available_permits();
                metrics::set_concurrent_ops(current_ops);
                Ok(permit)
            }
            Err(_) => {
                warn!(
                    "Rate limit exceeded: {} concurrent operations already in progress",
                    self.max_concurrent_ops
                );
                metrics::record_rate_limited(operation);
                Err(Status::resource_exhausted(format!(
                    "too many concurrent operations (limit {})",
                    self.max_concurrent_ops
                )))
            }
        }
    }
}

#[tonic::async_trait]
impl BlockDeviceAgent for BlockDeviceAgentService {
    /// Report the agent's identity and allocation parameters
    async fn get_agent_info(
        &self,
        _request: Request<GetAgentInfoRequest>,
    ) -> Result<Response<GetAgentInfoResponse>, Status> {
        Ok(Response::new(GetAgentInfoResponse {
            instance_id: self.api.compute_instance_id().to_string(),
            allocation_unit_bytes: self.api.allocation_unit(),
            cluster_id: self.api.cluster_id().to_string(),
        }))
    }

    /// Create a volume for a dataset
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();

        let dataset_id = parse_dataset_id(&req.dataset_id)?;
        if req.size_bytes == 0 {
            return Err(Status::invalid_argument("size_bytes must be positive"));
        }

        let _permit = self.acquire_permit("create_volume").await?;
        let timer = OperationTimer::new("create_volume");

        info!(%dataset_id, size_bytes = req.size_bytes, "CreateVolume request");

        match self.api.create_volume(dataset_id, req.size_bytes).await {
            Ok(volume) => {
                timer.success();
                Ok(Response::new(CreateVolumeResponse {
                    volume: Some(to_proto_volume(&volume)),
                }))
            }
            Err(e) => {
                warn!(%dataset_id, error = %e, "CreateVolume failed");
                timer.failure(error_label(&e));
                Err(device_error_to_status(&e))
            }
        }
    }

    /// List all volumes belonging to this cluster
    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let req = request.into_inner();

        let _permit = self.acquire_permit("list_volumes").await?;
        let timer = OperationTimer::new("list_volumes");

        let volumes = match self.api.list_volumes() {
            Ok(volumes) => volumes,
            Err(e) => {
                warn!(error = %e, "ListVolumes failed");
                timer.failure(error_label(&e));
                return Err(device_error_to_status(&e));
            }
        };

        metrics::set_cluster_volumes(volumes.len());

        let proto_volumes: Vec<proto::Volume> = volumes.iter().map(to_proto_volume).collect();
        let (paginated, next_token) = paginate(proto_volumes, req.max_entries, &req.starting_token)?;

        timer.success();
        Ok(Response::new(ListVolumesResponse {
            volumes: paginated,
            next_token,
        }))
    }

    /// Attach a volume to a compute instance
    async fn attach_volume(
        &self,
        request: Request<AttachVolumeRequest>,
    ) -> Result<Response<AttachVolumeResponse>, Status> {
        let req = request.into_inner();

        require_blockdevice_id(&req.blockdevice_id)?;
        if req.attach_to.is_empty() {
            return Err(Status::invalid_argument("attach_to cannot be empty"));
        }

        let _permit = self.acquire_permit("attach_volume").await?;
        let timer = OperationTimer::new("attach_volume");

        info!(
            blockdevice_id = %req.blockdevice_id,
            attach_to = %req.attach_to,
            "AttachVolume request"
        );

        match self.api.attach_volume(&req.blockdevice_id, &req.attach_to).await {
            Ok(volume) => {
                timer.success();
                Ok(Response::new(AttachVolumeResponse {
                    volume: Some(to_proto_volume(&volume)),
                }))
            }
            Err(e) => {
                warn!(blockdevice_id = %req.blockdevice_id, error = %e, "AttachVolume failed");
                timer.failure(error_label(&e));
                Err(device_error_to_status(&e))
            }
        }
    }

    /// Detach a volume from its current compute instance
    async fn detach_volume(
        &self,
        request: Request<DetachVolumeRequest>,
    ) -> Result<Response<DetachVolumeResponse>, Status> {
        let req = request.into_inner();

        require_blockdevice_id(&req.blockdevice_id)?;

        let _permit = self.acquire_permit("detach_volume").await?;
        let timer = OperationTimer::new("detach_volume");

        info!(blockdevice_id = %req.blockdevice_id, "DetachVolume request");

        match self.api.detach_volume(&req.blockdevice_id).await {
            Ok(()) => {
                timer.success();
                Ok(Response::new(DetachVolumeResponse {}))
            }
            Err(e) => {
                warn!(blockdevice_id = %req.blockdevice_id, error = %e, "DetachVolume failed");
                timer.failure(error_label(&e));
                Err(device_error_to_status(&e))
            }
        }
    }

    /// Destroy a volume (safe to retry)
    async fn destroy_volume(
        &self,
        request: Request<DestroyVolumeRequest>,
    ) -> Result<Response<DestroyVolumeResponse>, Status> {
        let req = request.into_inner();

        require_blockdevice_id(&req.blockdevice_id)?;

        let _permit = self.acquire_permit("destroy_volume").await?;
        let timer = OperationTimer::new("destroy_volume");

        info!(blockdevice_id = %req.blockdevice_id, "DestroyVolume request");

        match self.api.destroy_volume(&req.blockdevice_id).await {
            Ok(()) => {
                timer.success();
                Ok(Response::new(DestroyVolumeResponse {}))
            }
            Err(e) => {
                warn!(blockdevice_id = %req.blockdevice_id, error = %e, "DestroyVolume failed");
                timer.failure(error_label(&e));
                Err(device_error_to_status(&e))
            }
        }
    }

    /// Resolve the local OS device node for an attached volume
    async fn get_device_path(
        &self,
        request: Request<GetDevicePathRequest>,
    ) -> Result<Response<GetDevicePathResponse>, Status> {
        let req = request.into_inner();

        require_blockdevice_id(&req.blockdevice_id)?;

        let _permit = self.acquire_permit("get_device_path").await?;
        let timer = OperationTimer::new("get_device_path");

        match self.api.get_device_path(&req.blockdevice_id) {
            Ok(device_path) => {
                timer.success();
                Ok(Response::new(GetDevicePathResponse { device_path }))
            }
            Err(e) => {
                warn!(blockdevice_id = %req.blockdevice_id, error = %e, "GetDevicePath failed");
                timer.failure(error_label(&e));
                Err(device_error_to_status(&e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cio::error::CioError;

    #[test]
    fn test_paginate_empty_token() {
        let items = vec![1, 2, 3, 4, 5];
        let (page, token) = paginate(items, 2, "").unwrap();
        assert_eq!(page, vec![1, 2]);
        assert_eq!(token, "2");
    }

    #[test]
    fn test_paginate_valid_token() {
        let items = vec![1, 2, 3, 4, 5];
        let (page, token) = paginate(items, 2, "2").unwrap();
        assert_eq!(page, vec![3, 4]);
        assert_eq!(token, "4");
    }

    #[test]
    fn test_paginate_invalid_token_returns_error() {
        let items = vec![1, 2, 3];
        assert!(paginate(items, 2, "not-a-number").is_err());
    }

    #[test]
    fn test_paginate_last_page() {
        let items = vec![1, 2, 3, 4, 5];
        let (page, token) = paginate(items, 2, "4").unwrap();
        assert_eq!(page, vec![5]);
        assert!(token.is_empty());
    }

    #[test]
    fn test_paginate_zero_max_entries_returns_all() {
        let items = vec![1, 2, 3];
        let (page, token) = paginate(items, 0, "").unwrap();
        assert_eq!(page, vec![1, 2, 3]);
        assert!(token.is_empty());
    }

    #[test]
    fn test_to_proto_volume() {
        let dataset_id = Uuid::new_v4();
        let volume = BlockDeviceVolume {
            blockdevice_id: "vd1".to_string(),
            size: 8 * 1024 * 1024 * 1024,
            attached_to: None,
            dataset_id,
        };

        let proto_volume = to_proto_volume(&volume);
        assert_eq!(proto_volume.blockdevice_id, "vd1");
        assert_eq!(proto_volume.size_bytes, 8 * 1024 * 1024 * 1024);
        assert!(proto_volume.attached_to.is_empty());
        assert_eq!(proto_volume.dataset_id, dataset_id.to_string());
    }

    #[test]
    fn test_device_error_to_status_codes() {
        let status = device_error_to_status(&DeviceError::UnknownVolume("vd1".to_string()));
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status = device_error_to_status(&DeviceError::AlreadyAttached("vd1".to_string()));
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status = device_error_to_status(&DeviceError::Unattached("vd1".to_string()));
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status = device_error_to_status(&DeviceError::Timeout {
            blockdevice_id: "vd1".to_string(),
            operation: "attach",
            waited_secs: 120,
        });
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        let status = device_error_to_status(&DeviceError::Backend(CioError::CommandFailed(
            "boom".to_string(),
        )));
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[test]
    fn test_error_label_is_stable() {
        assert_eq!(
            error_label(&DeviceError::UnknownVolume("vd1".to_string())),
            "unknown_volume"
        );
        assert_eq!(
            error_label(&DeviceError::Timeout {
                blockdevice_id: "vd1".to_string(),
                operation: "attach",
                waited_secs: 1,
            }),
            "timeout"
        );
    }

    #[test]
    fn test_parse_dataset_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_dataset_id(&id.to_string()).unwrap(), id);
        assert!(parse_dataset_id("").is_err());
        assert!(parse_dataset_id("not-a-uuid").is_err());
    }
}
