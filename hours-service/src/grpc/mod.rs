//! gRPC module for hours-service.

mod service;

pub use service::HoursServiceImpl;

/// Generated protobuf code.
pub mod proto {
    tonic::include_proto!("seezee.hours.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("hours_descriptor");
}
