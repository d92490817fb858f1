pub mod bus;
pub mod config;
pub mod daemon;
pub mod dashboard;
pub mod error;
pub mod job;
pub mod node;
pub mod presence;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod status;
