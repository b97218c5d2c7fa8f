//! Session policy: retry, timeouts, checkpoints, continuation and checks.
//!
//! Policies load from YAML or JSON, are validated against an embedded JSON
//! Schema, and fill every omitted field with a default.

pub mod duration_ms;
mod parser;
pub mod schema;

pub use parser::{
    CheckPolicy, CheckpointPolicy, ContinuationPolicy, PolicyError, RetryPolicy, SessionPolicy,
    TimeoutPolicy,
};
pub use schema::{policy_schema, validate_policy_schema};
