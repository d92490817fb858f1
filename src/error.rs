use thiserror::Error;

use crate::bus::envelope::PeerIdentity;
use crate::bus::transport::TransportError;
use crate::job::{JobId, ProcessName};

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Process not found: {0}")]
    ProcessNotFound(ProcessName),

    #[error("Invalid job description: {0}")]
    InvalidJob(String),

    #[error("Lifeline to {0} lost")]
    LifelineLost(PeerIdentity),

    #[error("Another daemon for user {user} is already running on node {node}")]
    DuplicateDaemon { user: String, node: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scheduler could not answer: {0}")]
    Refused(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Actor channel closed")]
    ChannelClosed,
}

impl FleetError {
    /// Conditions a participant must not survive.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FleetError::LifelineLost(_) | FleetError::DuplicateDaemon { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
