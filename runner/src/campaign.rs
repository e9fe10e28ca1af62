//! Orchestration of a whole campaign.
//!
//! Benchmarks are resolved concurrently, dispatched one after another in
//! priority order and afterwards polled on a fixed cadence. Every cycle asks
//! the gateway once for all running jobs and derives a fresh set of status
//! records from the previous one; the view handed to the renderer is built
//! only after all records of the cycle were advanced.

use crate::{
    executors::{DispatchRequest, Dispatcher, Workpackage},
    gateway::{demultiplex, JobStates, StatusGateway},
    ingest::{compare, Comparison, ReferenceResults, ResultPuller, ResultSnapshot},
    parameters::{
        merge_resolved,
        nodes::{translate_custom_nodes, NodeRequest, NodeSetSyntax, SlurmNodeSet},
        resolve_parameters, ParameterContext, ParameterTable, ResolveError,
    },
    tracker::{advance_with, settle_results, CampaignState, CampaignStatusRecord},
};
use itertools::Itertools;
use rayon::prelude::*;
use serde::Serialize;
use std::{
    collections::BTreeSet,
    fmt,
    path::PathBuf,
    thread,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// A benchmark as registered into a campaign
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignBenchmark {
    pub name: String,
    pub priority: i64,
    pub template: Option<PathBuf>,
    pub parameters: ParameterTable,
    pub custom_nodes: Vec<NodeRequest>,
}

impl CampaignBenchmark {
    pub fn new(name: impl Into<String>, priority: i64) -> Self {
        Self {
            name: name.into(),
            priority,
            template: None,
            parameters: ParameterTable::new(),
            custom_nodes: Vec::new(),
        }
    }
}

pub struct CampaignSettings {
    pub poll_interval: Duration,
    /// resolved after the benchmark parameters of every workpackage
    pub platform: ParameterTable,
    /// reference results per benchmark, switches the post-loop step to comparison
    pub reference: Option<ReferenceResults>,
    pub node_syntax: Box<dyn NodeSetSyntax>,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            platform: ParameterTable::new(),
            reference: None,
            node_syntax: Box::new(SlurmNodeSet),
        }
    }
}

/// ascending priority, ties keep the declaration order
pub fn order_benchmarks(mut benchmarks: Vec<CampaignBenchmark>) -> Vec<CampaignBenchmark> {
    benchmarks.sort_by_key(|benchmark| benchmark.priority);

    benchmarks
}

/// Resolve one parameter set per custom node position, or a single one.
///
/// Each workpackage gets its own context: the pinned node fragment first,
/// then the benchmark parameters and finally the platform parameters, so
/// both may refer to the selected node count.
pub fn resolve_workpackages(
    benchmark: &CampaignBenchmark,
    platform: &ParameterTable,
    syntax: &dyn NodeSetSyntax,
) -> Result<Vec<Workpackage>, ResolveError> {
    let fragment = translate_custom_nodes(&benchmark.custom_nodes, syntax);
    let fragments = if fragment.is_empty() {
        vec![ParameterTable::new()]
    } else {
        (0..fragment.positions())
            .map(|position| fragment.pinned(position))
            .collect()
    };

    fragments
        .into_iter()
        .enumerate()
        .map(|(index, nodes)| {
            let mut context = ParameterContext::new();
            let mut parameters = resolve_parameters(&nodes, &mut context)?;

            merge_resolved(
                &mut parameters,
                resolve_parameters(&benchmark.parameters, &mut context)?,
            );
            merge_resolved(&mut parameters, resolve_parameters(platform, &mut context)?);

            Ok(Workpackage { index, parameters })
        })
        .collect()
}

/// What is known about a benchmark after the polling loop
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkOutcome {
    Failed(String),
    Compared(Comparison),
    Extracted(Option<ResultSnapshot>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub record: CampaignStatusRecord,
    pub outcome: BenchmarkOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignReport {
    /// number of polling cycles
    pub cycles: usize,
    /// in dispatch order
    pub benchmarks: Vec<BenchmarkReport>,
}

impl CampaignReport {
    pub fn failed(&self) -> impl Iterator<Item = &BenchmarkReport> {
        self.benchmarks
            .iter()
            .filter(|report| matches!(report.outcome, BenchmarkOutcome::Failed(_)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub benchmark: String,
    pub state: CampaignState,
    pub finished_jobs: usize,
    pub num_jobs: Option<usize>,
    pub note: Option<String>,
}

/// Consolidated status of all benchmarks after one polling cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusView {
    pub cycle: usize,
    pub rows: Vec<StatusRow>,
}

impl StatusView {
    fn new(cycle: usize, records: &[CampaignStatusRecord]) -> Self {
        let rows = records
            .iter()
            .map(|record| StatusRow {
                benchmark: record.benchmark.clone(),
                state: record.state,
                finished_jobs: record.finished_jobs,
                num_jobs: record.num_jobs,
                note: match (
                    &record.failure,
                    &record.last_gateway_error,
                    &record.last_pull_error,
                ) {
                    (Some(failure), _, _) => Some(format!("failed: {failure}")),
                    (None, Some(error), _) => Some(format!(
                        "no scheduler answer for {} cycle(s): {error}",
                        record.gateway_failures
                    )),
                    (None, None, Some(error)) => Some(format!("results not pulled: {error}")),
                    (None, None, None) => None,
                },
            })
            .collect();

        Self { cycle, rows }
    }
}

impl fmt::Display for StatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .rows
            .iter()
            .map(|row| row.benchmark.len())
            .chain(std::iter::once("benchmark".len()))
            .max()
            .unwrap_or_default();

        writeln!(f, "cycle {}", self.cycle)?;
        writeln!(f, "{:<width$}  {:<9}  jobs", "benchmark", "state")?;

        for row in self.rows.iter() {
            let jobs = match row.num_jobs {
                Some(total) => format!("{}/{total}", row.finished_jobs),
                None => String::from("-"),
            };

            write!(f, "{:<width$}  {:<9}  {jobs}", row.benchmark, row.state.to_string())?;

            if let Some(note) = &row.note {
                write!(f, "  {note}")?;
            }

            writeln!(f)?;
        }

        Ok(())
    }
}

/// Run all benchmarks to completion.
///
/// `render` receives the consolidated view once per polling cycle. A
/// benchmark that can't be resolved or dispatched is reported as failed and
/// never polled, the others are not affected.
#[instrument(skip_all, fields(benchmarks = benchmarks.len()))]
pub fn run_campaign<R>(
    benchmarks: Vec<CampaignBenchmark>,
    dispatcher: &dyn Dispatcher,
    gateway: &dyn StatusGateway,
    puller: &dyn ResultPuller,
    settings: &CampaignSettings,
    mut render: R,
) -> CampaignReport
where
    R: FnMut(&StatusView),
{
    let benchmarks = order_benchmarks(benchmarks);
    let syntax = settings.node_syntax.as_ref();

    let resolved = benchmarks
        .par_iter()
        .map(|benchmark| resolve_workpackages(benchmark, &settings.platform, syntax))
        .collect::<Vec<_>>();

    let mut records = Vec::with_capacity(benchmarks.len());
    let mut handles = Vec::with_capacity(benchmarks.len());

    for (benchmark, workpackages) in benchmarks.iter().zip(resolved) {
        let dispatched = workpackages
            .map_err(|error| error.to_string())
            .and_then(|workpackages| {
                info!(
                    benchmark = %benchmark.name,
                    priority = benchmark.priority,
                    workpackages = workpackages.len(),
                    "Dispatching"
                );

                dispatcher
                    .dispatch(DispatchRequest {
                        benchmark: &benchmark.name,
                        template: benchmark.template.as_deref(),
                        workpackages: &workpackages,
                    })
                    .map_err(|error| error.to_string())
            });

        match dispatched {
            Ok(handle) => {
                records.push(CampaignStatusRecord::new(&benchmark.name));
                handles.push(Some(handle));
            }
            Err(reason) => {
                warn!(benchmark = %benchmark.name, reason = %reason, "Benchmark not dispatched");

                records.push(CampaignStatusRecord::failed(&benchmark.name, reason));
                handles.push(None);
            }
        }
    }

    let mut cycles = 0;

    while !records.iter().all(CampaignStatusRecord::is_terminal) {
        cycles += 1;

        let job_ids = records
            .iter()
            .zip(handles.iter())
            .filter(|(record, _)| !record.is_terminal())
            .filter_map(|(_, handle)| handle.as_ref()?.job_ids())
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>();

        let observation = if job_ids.is_empty() {
            Ok(JobStates::new())
        } else {
            gateway.get_jobs_state(&job_ids)
        };

        if let Err(error) = &observation {
            warn!(cycle = cycles, error = %error, "Scheduler gateway unavailable");
        }

        records = records
            .par_iter()
            .zip(handles.par_iter_mut())
            .map(|(record, handle)| match handle {
                Some(handle) if !record.is_terminal() => advance_with(
                    record.clone(),
                    handle,
                    |ids| demultiplex(&observation, ids),
                    puller,
                ),
                _ => record.clone(),
            })
            .collect();

        render(&StatusView::new(cycles, &records));

        if records.iter().all(CampaignStatusRecord::is_terminal) {
            break;
        }

        debug!(interval = ?settings.poll_interval, "Sleeping until next cycle");
        thread::sleep(settings.poll_interval);
    }

    info!(cycles, "All benchmarks done");

    let benchmarks = records
        .into_iter()
        .map(|mut record| {
            let settled = settle_results(&mut record, puller);

            let outcome = match (&record.failure, settled, &settings.reference) {
                (Some(failure), _, _) => BenchmarkOutcome::Failed(failure.clone()),
                (None, Err(error), _) => {
                    BenchmarkOutcome::Failed(format!("results not pulled: {error}"))
                }
                (None, Ok(()), Some(reference)) => {
                    let expected = reference.get(&record.benchmark).cloned().unwrap_or_default();
                    let actual = record.latest_results().cloned().unwrap_or_default();

                    BenchmarkOutcome::Compared(compare(&expected, &actual))
                }
                (None, Ok(()), None) => {
                    BenchmarkOutcome::Extracted(record.latest_results().cloned())
                }
            };

            BenchmarkReport { record, outcome }
        })
        .collect_vec();

    CampaignReport { cycles, benchmarks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::nodes::{NODES_VARIABLE, SUBMIT_VARIABLE};

    fn benchmark(name: &str, priority: i64, parameters: &[(&str, &str)]) -> CampaignBenchmark {
        CampaignBenchmark {
            parameters: parameters.iter().copied().collect(),
            ..CampaignBenchmark::new(name, priority)
        }
    }

    #[test]
    fn orders_by_priority_then_declaration() {
        let ordered = order_benchmarks(vec![
            benchmark("a", 3, &[]),
            benchmark("b", 1, &[]),
            benchmark("c", 3, &[]),
            benchmark("d", -1, &[]),
        ]);

        assert_eq!(
            ordered.iter().map(|b| b.name.as_str()).collect_vec(),
            ["d", "b", "a", "c"]
        );
    }

    #[test]
    fn single_workpackage_without_custom_nodes() {
        let bench = benchmark("stream", 0, &[("n", "4"), ("size", "$n*1024")]);
        let platform: ParameterTable = [("cores", "128"), ("tasks", "$n*$cores")]
            .into_iter()
            .collect();

        let workpackages = resolve_workpackages(&bench, &platform, &SlurmNodeSet).unwrap();

        assert_eq!(workpackages.len(), 1);
        assert_eq!(workpackages[0].get("size"), Some("4096"));
        assert_eq!(workpackages[0].get("tasks"), Some("512"));
    }

    #[test]
    fn one_workpackage_per_node_request() {
        let mut bench = benchmark("hpl", 0, &[("ranks", "$custom_nodes*2")]);
        bench.custom_nodes = vec![NodeRequest::new(6, None), NodeRequest::new(1, Some("cn184"))];

        let workpackages =
            resolve_workpackages(&bench, &ParameterTable::new(), &SlurmNodeSet).unwrap();

        assert_eq!(workpackages.len(), 2);
        assert_eq!(workpackages[0].get(NODES_VARIABLE), Some("6"));
        assert_eq!(workpackages[0].get("ranks"), Some("12"));
        assert_eq!(workpackages[0].get(SUBMIT_VARIABLE), Some("--nodes=6"));
        assert_eq!(workpackages[1].index, 1);
        assert_eq!(
            workpackages[1].get(SUBMIT_VARIABLE),
            Some("--nodes=1 --nodelist=cn184")
        );
    }

    #[test]
    fn cycles_only_fail_their_benchmark() {
        let bench = benchmark("loop", 0, &[("a", "$b"), ("b", "$a")]);

        assert!(matches!(
            resolve_workpackages(&bench, &ParameterTable::new(), &SlurmNodeSet),
            Err(ResolveError::Cycle { .. })
        ));
    }

    #[test]
    fn view_renders_one_row_per_benchmark() {
        let mut running = CampaignStatusRecord::new("stream");
        running.state = CampaignState::Running;
        running.num_jobs = Some(2);
        running.finished_jobs = 1;
        let failed = CampaignStatusRecord::failed("hpl", "sbatch: denied");

        let view = StatusView::new(3, &[running, failed]);
        let text = view.to_string();

        assert!(text.starts_with("cycle 3\n"));
        assert!(text.contains("stream     RUNNING    1/2\n"));
        assert!(text.contains("hpl        INIT       -  failed: sbatch: denied\n"));
    }
}
