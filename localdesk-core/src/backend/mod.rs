//! Retrieval backend supervision.
//!
//! The backend is one long-running process. A start reclaims its port from
//! orphans of a previous run, clears stale lock files, spawns through the
//! launch strategy matching the build, and waits for the marker file plus a
//! positive health probe.

pub mod environment;
pub mod launch;
pub mod prepare;
pub mod readiness;
pub mod supervisor;

pub use environment::{BackendRuntimeConfig, PDF_MODE_KEY, VISION_MAX_PIXELS_KEY, endpoint_key};
pub use launch::LaunchStrategy;
pub use prepare::{PortInspector, SystemPortInspector};
pub use readiness::{HealthProbe, ReadinessOutcome, ReadinessPolicy, status_is_ready};
pub use supervisor::{BackendSettings, BackendState, BackendSupervisor};
