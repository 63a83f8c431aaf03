//! Services module for hours-service.

pub mod admin;
pub mod change_requests;
pub mod database;
pub mod memory;
pub mod metrics;
pub mod store;

pub use admin::{AdjustHours, AdminService, HoursBucket, PeriodAdvance};
pub use change_requests::{ChangeRequestService, Evaluation, SubmitChangeRequest, Submission};
pub use database::Database;
pub use memory::InMemoryHoursStore;
pub use metrics::{
    get_metrics, init_metrics, record_admin_operation, record_decision, record_error,
    record_grpc_request, record_grpc_request_duration, record_hours_consumed, record_stale_write,
};
pub use store::{Committed, FactsMutation, HoursStore, ProjectSnapshot, StoreError};
