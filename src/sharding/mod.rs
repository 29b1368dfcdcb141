//! Leader election and shard assignment.

pub mod allocate;
mod service;

pub use allocate::{allocate, JobAssignment, JobConfig};
pub use service::{ShardingEvent, ShardingService};
