pub mod mock;
pub mod slurm;

use crate::executors::local::LocalGateway;
use once_cell::sync::Lazy;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

/// job id -> scheduler state label, ids the scheduler doesn't know are absent
pub type JobStates = BTreeMap<String, String>;

/// label used for jobs missing from a gateway answer
pub const UNKNOWN_STATE: &str = "UNKNOWN";

/// states after which a job won't change anymore
pub static TERMINAL_STATES: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    BTreeSet::from([
        "COMPLETED",
        "FAILED",
        "CANCELLED",
        "TIMEOUT",
        "NODE_FAIL",
        "OUT_OF_MEMORY",
        "BOOT_FAIL",
        "DEADLINE",
        "PREEMPTED",
    ])
});

pub fn is_terminal(state: &str) -> bool {
    TERMINAL_STATES.contains(state)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Failed to spawn status command: {0}")]
    Spawn(String),
    #[error("Status command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Status command failed: {0}")]
    Command(String),
    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),
}

/// Source of scheduler job states
pub trait StatusGateway: Send + Sync {
    fn get_jobs_state(&self, job_ids: &BTreeSet<String>) -> Result<JobStates, GatewayError>;
}

/// all gateways the runner can be configured with
#[derive(Debug, Clone)]
pub enum Gateways {
    Slurm(slurm::SlurmGateway),
    Local(LocalGateway),
    Mock(Arc<mock::MockGateway>),
}

impl StatusGateway for Gateways {
    fn get_jobs_state(&self, job_ids: &BTreeSet<String>) -> Result<JobStates, GatewayError> {
        match self {
            Self::Slurm(gateway) => gateway.get_jobs_state(job_ids),
            Self::Local(gateway) => gateway.get_jobs_state(job_ids),
            Self::Mock(gateway) => gateway.get_jobs_state(job_ids),
        }
    }
}

impl<T: StatusGateway + ?Sized> StatusGateway for Arc<T> {
    fn get_jobs_state(&self, job_ids: &BTreeSet<String>) -> Result<JobStates, GatewayError> {
        (**self).get_jobs_state(job_ids)
    }
}

/// restrict a batched answer to the ids of one benchmark
pub fn demultiplex(
    observation: &Result<JobStates, GatewayError>,
    job_ids: &BTreeSet<String>,
) -> Result<JobStates, GatewayError> {
    match observation {
        Ok(states) => Ok(job_ids
            .iter()
            .filter_map(|id| states.get(id).map(|state| (id.clone(), state.clone())))
            .collect()),
        Err(error) => Err(error.clone()),
    }
}
