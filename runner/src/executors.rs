pub mod local;
pub mod mock;
pub mod slurm;
pub mod template;

use crate::{
    config::{CampaignConfig, ConfigErrors},
    gateway::Gateways,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to prepare execution directory {path:?}: {source}")]
    ExecDir { path: PathBuf, source: io::Error },
    #[error("Failed to read job template {path:?}: {source}")]
    Template { path: PathBuf, source: io::Error },
    #[error("Benchmark {0} needs a job template for this executor")]
    MissingTemplate(String),
    #[error("Failed to write parameter dump: {0}")]
    Parameters(#[from] serde_yaml::Error),
    #[error("Failed to spawn {command:?}: {source}")]
    Spawn { command: PathBuf, source: io::Error },
    #[error("Benchmark {0} has nothing to dispatch")]
    Empty(String),
}

/// resolved parameters for one execution directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workpackage {
    pub index: usize,
    pub parameters: Vec<(String, String)>,
}

impl Workpackage {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    pub benchmark: &'a str,
    pub template: Option<&'a Path>,
    pub workpackages: &'a [Workpackage],
}

impl DispatchRequest<'_> {
    /// `<outpath>/<benchmark>/<index>`
    pub fn exec_dir(&self, outpath: &Path, workpackage: &Workpackage) -> PathBuf {
        outpath
            .join(self.benchmark)
            .join(format!("{:06}", workpackage.index))
    }
}

/// What the dispatcher knows about a submission so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchProgress {
    Pending,
    Submitted(BTreeMap<PathBuf, String>),
    Failed(String),
}

/// Non-blocking view on an ongoing submission
pub trait DispatchProbe: Send + Debug {
    fn poll(&mut self) -> DispatchProgress;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Unknown,
    Success,
    Failure,
}

/// Handle on one dispatched benchmark.
///
/// The status stays `Unknown` until the probe reports a final outcome, which
/// is then cached together with the job ids.
#[derive(Debug)]
pub struct RunHandle {
    probe: Option<Box<dyn DispatchProbe>>,
    status: RunStatus,
    exec_dir_map: BTreeMap<PathBuf, String>,
    job_ids: Option<BTreeSet<String>>,
    failure: Option<String>,
}

impl RunHandle {
    pub fn new(probe: Box<dyn DispatchProbe>) -> Self {
        Self {
            probe: Some(probe),
            status: RunStatus::Unknown,
            exec_dir_map: BTreeMap::new(),
            job_ids: None,
            failure: None,
        }
    }

    /// handle for jobs whose ids are known right away
    pub fn submitted(exec_dir_map: BTreeMap<PathBuf, String>) -> Self {
        let mut handle = Self::new(Box::new(mock::ScriptedProbe::submitted(0, exec_dir_map)));
        handle.status();

        handle
    }

    pub fn status(&mut self) -> RunStatus {
        if self.status != RunStatus::Unknown {
            return self.status;
        }

        let Some(probe) = self.probe.as_mut() else {
            return self.status;
        };

        match probe.poll() {
            DispatchProgress::Pending => {}
            DispatchProgress::Submitted(exec_dir_map) => {
                debug!(jobs = exec_dir_map.len(), "Submission confirmed");

                self.job_ids = Some(exec_dir_map.values().cloned().collect());
                self.exec_dir_map = exec_dir_map;
                self.status = RunStatus::Success;
                self.probe = None;
            }
            DispatchProgress::Failed(reason) => {
                warn!(reason = %reason, "Submission failed");

                self.failure = Some(reason);
                self.status = RunStatus::Failure;
                self.probe = None;
            }
        }

        self.status
    }

    /// job ids, only available once the status is `Success`
    pub fn job_ids(&self) -> Option<&BTreeSet<String>> {
        self.job_ids.as_ref()
    }

    pub fn exec_dir_map(&self) -> &BTreeMap<PathBuf, String> {
        &self.exec_dir_map
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

/// Hands benchmarks over to something that runs them.
/// Returning means the submission was started, not that it finished.
pub trait Dispatcher: Sync {
    fn dispatch(&self, request: DispatchRequest<'_>) -> Result<RunHandle, DispatchError>;
}

#[derive(Debug)]
pub enum Executors {
    Slurm(slurm::SlurmExecutor),
    Local(local::LocalExecutor),
    Mock(mock::MockExecutor),
}

impl Executors {
    pub fn load(config: &CampaignConfig) -> Result<Self, ConfigErrors> {
        let outpath = config.campaign.outpath.clone();

        match config.executor.name.as_str() {
            "slurm" => Ok(Self::Slurm(slurm::SlurmExecutor::load(
                &config.executor,
                outpath,
            )?)),
            "local" => Ok(Self::Local(local::LocalExecutor::load(
                &config.executor,
                outpath,
            )?)),
            "mock" => Ok(Self::Mock(mock::MockExecutor::load(
                &config.executor,
                outpath,
            )?)),
            _ => Err(ConfigErrors::UnsupportedExecutor(
                config.executor.name.clone(),
            )),
        }
    }

    /// the gateway that observes jobs of this executor
    pub fn gateway(&self) -> Gateways {
        match self {
            Self::Slurm(executor) => Gateways::Slurm(executor.gateway()),
            Self::Local(executor) => Gateways::Local(executor.gateway()),
            Self::Mock(executor) => Gateways::Mock(executor.gateway()),
        }
    }
}

impl Dispatcher for Executors {
    fn dispatch(&self, request: DispatchRequest<'_>) -> Result<RunHandle, DispatchError> {
        if request.workpackages.is_empty() {
            return Err(DispatchError::Empty(request.benchmark.to_owned()));
        }

        match self {
            Self::Slurm(executor) => executor.dispatch(request),
            Self::Local(executor) => executor.dispatch(request),
            Self::Mock(executor) => executor.dispatch(request),
        }
    }
}
