//! Core routing state for the edge gateway
//!
//! This library provides:
//! - Service registrations describing backend instances
//! - A concurrency-safe service registry partitioned per service name
//! - The error taxonomy and the structured error body returned to callers

pub mod registration;
pub mod registry;
pub mod error;

pub use registration::{HealthStatus, ServiceRegistration};
pub use registry::ServiceRegistry;
pub use error::{CoreError, ErrorResponse, Result};
