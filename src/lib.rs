pub mod cleanup;
pub mod config;
pub mod controller;
pub mod coordination;
pub mod error;
pub mod jobs;
pub mod listeners;
pub mod paths;
pub mod recovery;
pub mod sharding;
pub mod shutdown;
pub mod watch;

pub use config::ControllerConfig;
pub use controller::ShardingController;
pub use error::{Result, ShardingError};
