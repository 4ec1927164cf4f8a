pub mod agent;

pub use agent::BlockDeviceAgentService;

/// Generated protobuf types and service trait
pub mod proto {
    tonic::include_proto!("cio_agent.v1");
}
