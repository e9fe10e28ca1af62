use crate::{
    executors::{RunHandle, RunStatus},
    gateway::{is_terminal, GatewayError, JobStates, StatusGateway, UNKNOWN_STATE},
    ingest::{IngestorError, ResultPuller, ResultSnapshot},
};
use serde::{Deserialize, Serialize};
use serde_repr::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
};
use tracing::{debug, info, warn};

/// Lifecycle of one benchmark inside a campaign, only ever moves forward
#[derive(
    Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[repr(u8)]
pub enum CampaignState {
    Init = 0,
    Compiling = 1,
    Running = 2,
    Finished = 3,
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Compiling => "COMPILING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub exec_dir: PathBuf,
    pub job_id: String,
    pub scheduler_state: String,
    /// row of the latest results snapshot for this execution directory
    pub result: Option<BTreeMap<String, serde_yaml::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignStatusRecord {
    pub benchmark: String,
    pub state: CampaignState,
    /// replaced as a whole on every successful observation
    pub jobs: Vec<JobSnapshot>,
    /// set once, when the dispatch is confirmed
    pub num_jobs: Option<usize>,
    pub finished_jobs: usize,
    /// snapshots keyed by the finished job count they were pulled at
    pub results: Option<BTreeMap<usize, ResultSnapshot>>,
    /// dispatch failure, the record is no longer polled once set
    pub failure: Option<String>,
    /// consecutive cycles without an answer from the gateway
    pub gateway_failures: usize,
    pub last_gateway_error: Option<String>,
    /// error of the most recent result pull, cleared by the next successful one
    #[serde(default)]
    pub last_pull_error: Option<String>,
}

impl CampaignStatusRecord {
    pub fn new(benchmark: impl Into<String>) -> Self {
        Self {
            benchmark: benchmark.into(),
            state: CampaignState::Init,
            jobs: Vec::new(),
            num_jobs: None,
            finished_jobs: 0,
            results: None,
            failure: None,
            gateway_failures: 0,
            last_gateway_error: None,
            last_pull_error: None,
        }
    }

    pub fn failed(benchmark: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::new(benchmark)
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == CampaignState::Finished
    }

    /// nothing will change this record anymore
    pub fn is_terminal(&self) -> bool {
        self.is_finished() || self.failure.is_some()
    }

    /// most recent results snapshot
    pub fn latest_results(&self) -> Option<&ResultSnapshot> {
        self.results
            .as_ref()
            .and_then(|results| results.values().next_back())
    }

    /// the latest pull succeeded and was taken at the current finished count
    pub fn has_current_results(&self) -> bool {
        self.last_pull_error.is_none()
            && self
                .results
                .as_ref()
                .is_some_and(|results| results.contains_key(&self.finished_jobs))
    }

    fn pull(&mut self, puller: &dyn ResultPuller) -> Result<(), IngestorError> {
        match puller.pull_results(&self.benchmark) {
            Ok(snapshot) => {
                self.results
                    .get_or_insert_with(BTreeMap::new)
                    .insert(self.finished_jobs, snapshot);
                self.last_pull_error = None;

                Ok(())
            }
            Err(error) => {
                warn!(benchmark = %self.benchmark, error = %error, "Failed to pull results");
                self.last_pull_error = Some(error.to_string());

                Err(error)
            }
        }
    }

    /// fill the result row of every job from the latest snapshot
    fn attach_results(&mut self) {
        let latest = self.latest_results().cloned();

        for job in self.jobs.iter_mut() {
            job.result = latest.as_ref().and_then(|results| {
                let name = job.exec_dir.file_name()?.to_str()?;

                results.row(name).cloned()
            });
        }
    }
}

/// Pull the results of a finished benchmark once more if the snapshot for its
/// final job count is missing or the last pull failed.
pub fn settle_results(
    record: &mut CampaignStatusRecord,
    puller: &dyn ResultPuller,
) -> Result<(), IngestorError> {
    if !record.is_finished() || record.finished_jobs == 0 || record.has_current_results() {
        return Ok(());
    }

    debug!(benchmark = %record.benchmark, finished = record.finished_jobs, "Pulling final results");

    record.pull(puller)?;
    record.attach_results();

    Ok(())
}

/// Single step of the status state machine, the gateway answer is taken from
/// `observe` which is only called for records in `RUNNING`.
pub fn advance_with<F>(
    mut record: CampaignStatusRecord,
    handle: &mut RunHandle,
    observe: F,
    puller: &dyn ResultPuller,
) -> CampaignStatusRecord
where
    F: FnOnce(&BTreeSet<String>) -> Result<JobStates, GatewayError>,
{
    if record.is_terminal() {
        return record;
    }

    match handle.status() {
        RunStatus::Unknown => {
            if record.state == CampaignState::Init {
                debug!(benchmark = %record.benchmark, "Waiting for submission");
                record.state = CampaignState::Compiling;
            }

            return record;
        }
        RunStatus::Failure => {
            let reason = handle.failure().unwrap_or("dispatch failed").to_owned();
            warn!(benchmark = %record.benchmark, reason = %reason, "Benchmark failed to dispatch");

            record.failure = Some(reason);

            return record;
        }
        RunStatus::Success => {}
    }

    let job_ids = handle.job_ids().cloned().unwrap_or_default();

    if record.state < CampaignState::Running {
        info!(benchmark = %record.benchmark, jobs = job_ids.len(), "Benchmark running");

        record.state = CampaignState::Running;
        record.num_jobs = Some(job_ids.len());
        record.finished_jobs = 0;
        record.results = Some(BTreeMap::new());
    }

    let num_jobs = record.num_jobs.unwrap_or(job_ids.len());

    if num_jobs == 0 {
        record.state = CampaignState::Finished;

        return record;
    }

    let states = match observe(&job_ids) {
        Ok(states) => states,
        Err(error) => {
            record.gateway_failures += 1;
            warn!(
                benchmark = %record.benchmark,
                failures = record.gateway_failures,
                error = %error,
                "No job states this cycle"
            );
            record.last_gateway_error = Some(error.to_string());

            return record;
        }
    };

    record.gateway_failures = 0;
    record.last_gateway_error = None;

    let finished = job_ids
        .iter()
        .filter(|id| states.get(*id).is_some_and(|state| is_terminal(state)))
        .count();

    if finished > record.finished_jobs {
        debug!(
            benchmark = %record.benchmark,
            finished,
            previous = record.finished_jobs,
            "Pulling results"
        );

        record.finished_jobs = finished;
        // a failure is kept on the record and retried once the benchmark is done
        record.pull(puller).ok();
    }

    record.jobs = handle
        .exec_dir_map()
        .iter()
        .map(|(exec_dir, job_id)| JobSnapshot {
            exec_dir: exec_dir.clone(),
            job_id: job_id.clone(),
            scheduler_state: states
                .get(job_id)
                .cloned()
                .unwrap_or_else(|| UNKNOWN_STATE.to_owned()),
            result: None,
        })
        .collect();
    record.attach_results();

    if record.finished_jobs >= num_jobs {
        info!(benchmark = %record.benchmark, "Benchmark finished");
        record.state = CampaignState::Finished;
    }

    record
}

/// [`advance_with`] asking `gateway` directly
pub fn advance_campaign_status(
    record: CampaignStatusRecord,
    handle: &mut RunHandle,
    gateway: &dyn StatusGateway,
    puller: &dyn ResultPuller,
) -> CampaignStatusRecord {
    advance_with(record, handle, |ids| gateway.get_jobs_state(ids), puller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{executors::mock::ScriptedProbe, gateway::mock::MockGateway};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingPuller {
        pulls: Mutex<usize>,
    }

    impl ResultPuller for CountingPuller {
        fn pull_results(&self, _benchmark: &str) -> Result<ResultSnapshot, IngestorError> {
            let mut pulls = self.pulls.lock();
            *pulls += 1;

            Ok(serde_yaml::from_str(&format!("'000000': {{pull: {}}}", *pulls))?)
        }
    }

    /// fails the first `failures` pulls, then answers with one row
    struct FlakyPuller {
        failures: Mutex<usize>,
        calls: Mutex<usize>,
    }

    impl FlakyPuller {
        fn new(failures: usize) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: Mutex::new(0),
            }
        }
    }

    impl ResultPuller for FlakyPuller {
        fn pull_results(&self, _benchmark: &str) -> Result<ResultSnapshot, IngestorError> {
            *self.calls.lock() += 1;
            let mut failures = self.failures.lock();

            if *failures > 0 {
                *failures -= 1;

                return Err(IngestorError::ChildFailed("exit status: 1".to_owned()));
            }

            Ok(serde_yaml::from_str("'000000': {gflops: 3}")?)
        }
    }

    fn handle(pending: usize, jobs: &[&str]) -> RunHandle {
        let map = jobs
            .iter()
            .enumerate()
            .map(|(index, id)| (PathBuf::from(format!("runs/b/{index:06}")), id.to_string()))
            .collect();

        RunHandle::new(Box::new(ScriptedProbe::submitted(pending, map)))
    }

    #[test]
    fn walks_through_all_states() {
        let gateway = MockGateway::new();
        gateway.script("1", ["RUNNING", "COMPLETED"]);
        gateway.script("2", ["PENDING", "RUNNING", "FAILED"]);
        let puller = CountingPuller::default();
        let mut handle = handle(1, &["1", "2"]);

        let mut record = CampaignStatusRecord::new("b");
        let mut seen = Vec::new();

        for _ in 0..5 {
            record = advance_campaign_status(record, &mut handle, &gateway, &puller);
            seen.push((record.state, record.finished_jobs));
        }

        assert_eq!(
            seen,
            vec![
                (CampaignState::Compiling, 0),
                (CampaignState::Running, 0),
                (CampaignState::Running, 1),
                (CampaignState::Finished, 2),
                (CampaignState::Finished, 2),
            ]
        );
        assert_eq!(record.num_jobs, Some(2));
        assert_eq!(*puller.pulls.lock(), 2);
        assert_eq!(record.results.as_ref().map(BTreeMap::len), Some(2));
        assert_eq!(
            record.jobs[0].result.as_ref().map(|row| row["pull"].clone()),
            Some(serde_yaml::Value::from(2))
        );
    }

    #[test]
    fn state_and_progress_never_regress() {
        let puller = CountingPuller::default();
        let mut handle = handle(0, &["1", "2", "3"]);
        // terminal counts as observed by a flaky scheduler
        let observations = [
            vec![("1", "COMPLETED")],
            vec![("1", "COMPLETED"), ("2", "COMPLETED")],
            vec![("2", "COMPLETED")],
            vec![],
            vec![("1", "COMPLETED"), ("2", "COMPLETED")],
            vec![("1", "COMPLETED"), ("2", "COMPLETED"), ("3", "TIMEOUT")],
        ];

        let mut record = CampaignStatusRecord::new("b");
        let mut previous = (record.state, record.finished_jobs);

        for observation in observations {
            let states: JobStates = observation
                .into_iter()
                .map(|(id, state)| (id.to_owned(), state.to_owned()))
                .collect();

            record = advance_with(record, &mut handle, |_| Ok(states), &puller);

            assert!(record.state >= previous.0);
            assert!(record.finished_jobs >= previous.1);
            previous = (record.state, record.finished_jobs);
        }

        assert!(record.is_finished());
        assert_eq!(record.finished_jobs, 3);
        // one pull per increment: 1, 2, 3
        assert_eq!(*puller.pulls.lock(), 3);
    }

    #[test]
    fn finished_records_are_left_alone() {
        let puller = CountingPuller::default();
        let mut handle = handle(0, &["1"]);
        let mut record = advance_with(
            CampaignStatusRecord::new("b"),
            &mut handle,
            |_| Ok(JobStates::from([("1".to_owned(), "COMPLETED".to_owned())])),
            &puller,
        );
        assert!(record.is_finished());

        let before = record.clone();
        let mut other = RunHandle::new(Box::new(ScriptedProbe::failed(0, "late failure")));

        record = advance_with(
            record,
            &mut other,
            |_| Err(GatewayError::Unavailable("down".to_owned())),
            &puller,
        );

        assert_eq!(record, before);
    }

    #[test]
    fn outages_keep_previous_observation() {
        let puller = CountingPuller::default();
        let mut handle = handle(0, &["1", "2"]);
        let record = advance_with(
            CampaignStatusRecord::new("b"),
            &mut handle,
            |_| Ok(JobStates::from([("1".to_owned(), "COMPLETED".to_owned())])),
            &puller,
        );

        let after = advance_with(
            record.clone(),
            &mut handle,
            |_| Err(GatewayError::Timeout(std::time::Duration::from_secs(1))),
            &puller,
        );

        assert_eq!(after.jobs, record.jobs);
        assert_eq!(after.finished_jobs, record.finished_jobs);
        assert_eq!(after.state, record.state);
        assert_eq!(after.gateway_failures, 1);
        assert!(after.last_gateway_error.is_some());
    }

    #[test]
    fn missing_jobs_are_unknown() {
        let puller = CountingPuller::default();
        let mut handle = handle(0, &["1", "2"]);
        let record = advance_with(
            CampaignStatusRecord::new("b"),
            &mut handle,
            |_| Ok(JobStates::from([("1".to_owned(), "RUNNING".to_owned())])),
            &puller,
        );

        assert_eq!(record.jobs[1].scheduler_state, UNKNOWN_STATE);
        assert_eq!(record.state, CampaignState::Running);
    }

    #[test]
    fn dispatch_failure_is_recorded_not_a_state() {
        let puller = CountingPuller::default();
        let mut handle = RunHandle::new(Box::new(ScriptedProbe::failed(1, "sbatch: denied")));

        let mut record = CampaignStatusRecord::new("b");
        record = advance_with(record, &mut handle, |_| unreachable!(), &puller);
        assert_eq!(record.state, CampaignState::Compiling);

        record = advance_with(record, &mut handle, |_| unreachable!(), &puller);
        assert_eq!(record.state, CampaignState::Compiling);
        assert_eq!(record.failure.as_deref(), Some("sbatch: denied"));
        assert!(record.is_terminal());
    }

    #[test]
    fn empty_dispatch_finishes_immediately() {
        let puller = CountingPuller::default();
        let mut handle = RunHandle::submitted(BTreeMap::new());

        let record = advance_with(
            CampaignStatusRecord::new("b"),
            &mut handle,
            |_| unreachable!(),
            &puller,
        );

        assert!(record.is_finished());
        assert_eq!(record.num_jobs, Some(0));
    }

    #[test]
    fn failed_pull_is_kept_and_settled_later() {
        let puller = FlakyPuller::new(1);
        let mut handle = handle(0, &["1"]);

        let mut record = advance_with(
            CampaignStatusRecord::new("b"),
            &mut handle,
            |_| Ok(JobStates::from([("1".to_owned(), "COMPLETED".to_owned())])),
            &puller,
        );

        assert!(record.is_finished());
        assert_eq!(record.finished_jobs, 1);
        assert!(record.last_pull_error.is_some());
        assert!(!record.has_current_results());
        assert_eq!(record.jobs[0].result, None);

        settle_results(&mut record, &puller).unwrap();

        assert!(record.has_current_results());
        assert_eq!(record.last_pull_error, None);
        assert_eq!(
            record.jobs[0].result.as_ref().map(|row| row["gflops"].clone()),
            Some(serde_yaml::Value::from(3))
        );

        // nothing left to catch up on
        settle_results(&mut record, &puller).unwrap();
        assert_eq!(*puller.calls.lock(), 2);
    }

    #[test]
    fn settling_reports_a_persistent_failure() {
        let puller = FlakyPuller::new(usize::MAX);
        let mut handle = handle(0, &["1"]);

        let mut record = advance_with(
            CampaignStatusRecord::new("b"),
            &mut handle,
            |_| Ok(JobStates::from([("1".to_owned(), "COMPLETED".to_owned())])),
            &puller,
        );

        assert!(matches!(
            settle_results(&mut record, &puller),
            Err(IngestorError::ChildFailed(_))
        ));
        assert!(record.last_pull_error.is_some());
        assert_eq!(record.latest_results(), None);
    }

    #[test]
    fn current_results_are_not_pulled_again() {
        let puller = CountingPuller::default();
        let mut handle = handle(0, &["1"]);

        let mut record = advance_with(
            CampaignStatusRecord::new("b"),
            &mut handle,
            |_| Ok(JobStates::from([("1".to_owned(), "COMPLETED".to_owned())])),
            &puller,
        );

        settle_results(&mut record, &puller).unwrap();

        assert_eq!(*puller.pulls.lock(), 1);
    }
}
