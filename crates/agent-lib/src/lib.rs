//! Agent library for batch cycle monitoring
//!
//! This crate provides the core functionality for:
//! - Supervised sessions against an automation endpoint
//! - Batch cycle tracking with rolling throughput predictions
//! - Mirror, dosing interlock and setpoint sequence actuators
//! - Periodic signal sampling into CSV record sinks
//! - Health checks and observability

pub mod dosing;
pub mod error;
pub mod health;
pub mod mirror;
pub mod models;
pub mod observability;
pub mod sampler;
pub mod sequence;
pub mod session;
pub mod sink;
pub mod supervisor;
pub mod tracker;

pub use error::{ComputationAnomaly, ConfigError, SessionError, SinkError, SupervisorError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use session::{Credentials, EndpointConfig, Session, SessionFactory, SessionState};
pub use supervisor::{Supervisor, SupervisorBuilder, SupervisorConfig, SupervisorReport};
pub use tracker::{CycleTracker, TrackerConfig, TrackerSnapshot};
