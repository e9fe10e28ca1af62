use super::{
    DispatchError, DispatchProbe, DispatchProgress, DispatchRequest, Dispatcher, RunHandle,
};
use crate::{
    config::{ConfigErrors, ExecutorConfig},
    gateway::mock::MockGateway,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::info;

/// Probe reporting `Pending` a fixed number of times before its outcome
#[derive(Debug, Clone)]
pub struct ScriptedProbe {
    pending: usize,
    outcome: DispatchProgress,
}

impl ScriptedProbe {
    pub fn submitted(pending: usize, exec_dir_map: BTreeMap<PathBuf, String>) -> Self {
        Self {
            pending,
            outcome: DispatchProgress::Submitted(exec_dir_map),
        }
    }

    pub fn failed(pending: usize, reason: impl Into<String>) -> Self {
        Self {
            pending,
            outcome: DispatchProgress::Failed(reason.into()),
        }
    }
}

impl DispatchProbe for ScriptedProbe {
    fn poll(&mut self) -> DispatchProgress {
        if self.pending > 0 {
            self.pending -= 1;

            DispatchProgress::Pending
        } else {
            self.outcome.clone()
        }
    }
}

/// Dry-run executor, nothing leaves the process.
///
/// Every workpackage gets a synthetic job id that the paired [`MockGateway`]
/// walks through `PENDING`, `RUNNING` and finally `COMPLETED`.
#[derive(Debug)]
pub struct MockExecutor {
    gateway: Arc<MockGateway>,
    outpath: PathBuf,
    /// polls a job spends in `RUNNING`
    pub running_polls: usize,
    /// polls the submission stays unconfirmed
    pub pending_polls: usize,
    failing: BTreeSet<String>,
    dispatched: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl MockExecutor {
    pub fn new(gateway: Arc<MockGateway>, outpath: PathBuf) -> Self {
        Self {
            gateway,
            outpath,
            running_polls: 1,
            pending_polls: 1,
            failing: BTreeSet::new(),
            dispatched: Mutex::new(Vec::new()),
            counter: AtomicU64::new(1),
        }
    }

    pub fn load(config: &ExecutorConfig, outpath: PathBuf) -> Result<Self, ConfigErrors> {
        let mut executor = Self::new(Arc::new(MockGateway::new()), outpath);

        if let Some(polls) = config.parameter_u64("running_polls")? {
            executor.running_polls = polls as usize;
        }
        if let Some(polls) = config.parameter_u64("pending_polls")? {
            executor.pending_polls = polls as usize;
        }

        Ok(executor)
    }

    /// make dispatching `benchmark` fail
    pub fn failing(mut self, benchmark: impl Into<String>) -> Self {
        self.failing.insert(benchmark.into());
        self
    }

    pub fn gateway(&self) -> Arc<MockGateway> {
        self.gateway.clone()
    }

    /// benchmark names in the order they were dispatched
    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().clone()
    }
}

impl Dispatcher for MockExecutor {
    fn dispatch(&self, request: DispatchRequest<'_>) -> Result<RunHandle, DispatchError> {
        self.dispatched.lock().push(request.benchmark.to_owned());

        if self.failing.contains(request.benchmark) {
            return Ok(RunHandle::new(Box::new(ScriptedProbe::failed(
                self.pending_polls,
                format!("refusing to submit {}", request.benchmark),
            ))));
        }

        let mut exec_dir_map = BTreeMap::new();

        for workpackage in request.workpackages {
            let job_id = (1000 + self.counter.fetch_add(1, Ordering::SeqCst)).to_string();

            self.gateway.script(
                job_id.clone(),
                std::iter::once("PENDING")
                    .chain(std::iter::repeat("RUNNING").take(self.running_polls))
                    .chain(std::iter::once("COMPLETED")),
            );
            exec_dir_map.insert(request.exec_dir(&self.outpath, workpackage), job_id);
        }

        info!(
            benchmark = request.benchmark,
            jobs = exec_dir_map.len(),
            "Pretending to submit"
        );

        Ok(RunHandle::new(Box::new(ScriptedProbe::submitted(
            self.pending_polls,
            exec_dir_map,
        ))))
    }
}
