//! Shared types for the certman operator.
//!
//! - [`ids`] - owner and request-name newtypes
//! - [`observe`] - observability events and sinks

pub mod ids;
pub mod observe;

pub use ids::{OwnerId, RequestName};
pub use observe::{NoopSink, Observation, ObservabilitySink, RecordingSink};
