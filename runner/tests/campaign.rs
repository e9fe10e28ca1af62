use campaign_runner::{
    campaign::{run_campaign, BenchmarkOutcome, CampaignBenchmark, CampaignSettings},
    executors::mock::MockExecutor,
    gateway::{mock::MockGateway, StatusGateway},
    ingest::{IngestorError, Ingestors, ResultPuller, ResultSnapshot},
    tracker::CampaignState,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

fn settings() -> CampaignSettings {
    CampaignSettings {
        poll_interval: Duration::ZERO,
        ..CampaignSettings::default()
    }
}

fn benchmarks() -> Vec<CampaignBenchmark> {
    vec![
        CampaignBenchmark::new("bench1", 3),
        CampaignBenchmark::new("bench2", 1),
        CampaignBenchmark::new("bench3", 2),
    ]
}

#[test]
fn dispatches_by_priority_and_waits_for_all() {
    let gateway = Arc::new(MockGateway::new());
    let mut executor = MockExecutor::new(gateway.clone(), PathBuf::from("runs"));
    executor.running_polls = 2;

    let mut finished_per_cycle = Vec::new();
    let report = run_campaign(
        benchmarks(),
        &executor,
        &gateway,
        &Ingestors::Null,
        &settings(),
        |view| {
            finished_per_cycle.push(
                view.rows
                    .iter()
                    .filter(|row| row.state == CampaignState::Finished)
                    .count(),
            )
        },
    );

    assert_eq!(executor.dispatched(), ["bench2", "bench3", "bench1"]);
    assert_eq!(
        report
            .benchmarks
            .iter()
            .map(|report| report.record.benchmark.as_str())
            .collect::<Vec<_>>(),
        ["bench2", "bench3", "bench1"]
    );
    assert!(report
        .benchmarks
        .iter()
        .all(|report| report.record.state == CampaignState::Finished));

    // the loop ends with the cycle that finished the last benchmark
    assert_eq!(finished_per_cycle.last(), Some(&3));
    assert!(finished_per_cycle[..finished_per_cycle.len() - 1]
        .iter()
        .all(|finished| *finished < 3));
    assert_eq!(report.cycles, finished_per_cycle.len());
    assert_eq!(report.failed().count(), 0);
}

#[test]
fn dispatch_failures_stay_isolated() {
    let gateway = Arc::new(MockGateway::new());
    let executor =
        MockExecutor::new(gateway.clone(), PathBuf::from("runs")).failing("bench3");

    let report = run_campaign(
        benchmarks(),
        &executor,
        &gateway,
        &Ingestors::Null,
        &settings(),
        |_| {},
    );

    let failed = report
        .failed()
        .map(|report| report.record.benchmark.as_str())
        .collect::<Vec<_>>();

    assert_eq!(failed, ["bench3"]);
    assert_eq!(report.benchmarks.len(), 3);
    assert!(report
        .benchmarks
        .iter()
        .filter(|report| report.record.benchmark != "bench3")
        .all(|report| report.record.state == CampaignState::Finished));
}

#[test]
fn unresolvable_benchmarks_are_reported_failed() {
    let gateway = Arc::new(MockGateway::new());
    let executor = MockExecutor::new(gateway.clone(), PathBuf::from("runs"));

    let mut broken = CampaignBenchmark::new("broken", 0);
    broken.parameters = [("a", "$b"), ("b", "$a")].into_iter().collect();

    let report = run_campaign(
        vec![broken, CampaignBenchmark::new("fine", 1)],
        &executor,
        &gateway,
        &Ingestors::Null,
        &settings(),
        |_| {},
    );

    assert_eq!(executor.dispatched(), ["fine"]);
    assert!(matches!(
        &report.benchmarks[0].outcome,
        BenchmarkOutcome::Failed(reason) if reason.contains("cycle")
    ));
    assert_eq!(report.benchmarks[1].record.state, CampaignState::Finished);
}

#[test]
fn gateway_outages_delay_but_do_not_break_the_campaign() {
    let gateway = Arc::new(MockGateway::new());
    let mut executor = MockExecutor::new(gateway.clone(), PathBuf::from("runs"));
    executor.pending_polls = 0;

    let mut notes = Vec::new();
    let outages = gateway.clone();
    let report = run_campaign(
        vec![CampaignBenchmark::new("only", 0)],
        &executor,
        &gateway,
        &Ingestors::Null,
        &settings(),
        |view| {
            // scheduler goes away right after the benchmark started running
            if view.cycle == 1 {
                outages.fail_next(2);
            }
            notes.push(view.rows[0].note.clone());
        },
    );

    assert_eq!(report.benchmarks[0].record.state, CampaignState::Finished);
    assert_eq!(notes.iter().filter(|note| note.is_some()).count(), 2);
    assert_eq!(report.benchmarks[0].record.gateway_failures, 0);
}

struct FixedResults;

impl ResultPuller for FixedResults {
    fn pull_results(&self, benchmark: &str) -> Result<ResultSnapshot, IngestorError> {
        Ok(serde_yaml::from_str(&format!("'000000': {{name: {benchmark}, gflops: 10}}"))?)
    }
}

#[test]
fn results_are_compared_against_references() {
    let gateway = Arc::new(MockGateway::new());
    let executor = MockExecutor::new(gateway.clone(), PathBuf::from("runs"));

    let reference = BTreeMap::from([
        (
            "bench1".to_owned(),
            serde_yaml::from_str("'000000': {gflops: 10}").unwrap(),
        ),
        (
            "bench2".to_owned(),
            serde_yaml::from_str("'000000': {gflops: 12}").unwrap(),
        ),
    ]);
    let settings = CampaignSettings {
        reference: Some(reference),
        ..settings()
    };

    let report = run_campaign(
        benchmarks(),
        &executor,
        &gateway,
        &FixedResults,
        &settings,
        |_| {},
    );

    let outcomes = report
        .benchmarks
        .iter()
        .map(|report| {
            let BenchmarkOutcome::Compared(comparison) = &report.outcome else {
                panic!("{} was not compared", report.record.benchmark);
            };

            (report.record.benchmark.as_str(), comparison.is_match())
        })
        .collect::<BTreeMap<_, _>>();

    assert!(outcomes["bench1"]);
    assert!(!outcomes["bench2"]);
    // nothing to compare against
    assert!(outcomes["bench3"]);
}

#[test]
fn extracts_latest_results_without_reference() {
    let gateway = Arc::new(MockGateway::new());
    let executor = MockExecutor::new(gateway.clone(), PathBuf::from("runs"));

    let report = run_campaign(
        vec![CampaignBenchmark::new("stream", 0)],
        &executor,
        &gateway,
        &FixedResults,
        &settings(),
        |_| {},
    );

    let BenchmarkOutcome::Extracted(Some(results)) = &report.benchmarks[0].outcome else {
        panic!("expected extracted results");
    };

    assert_eq!(
        results.row("000000").map(|row| row["name"].clone()),
        Some(serde_yaml::Value::from("stream"))
    );
    assert_eq!(
        report.benchmarks[0].record.jobs[0].result,
        results.row("000000").cloned()
    );
}

/// refuses the first `failures` pulls
struct FlakyResults {
    failures: Mutex<usize>,
}

impl FlakyResults {
    fn new(failures: usize) -> Self {
        Self {
            failures: Mutex::new(failures),
        }
    }
}

impl ResultPuller for FlakyResults {
    fn pull_results(&self, benchmark: &str) -> Result<ResultSnapshot, IngestorError> {
        let mut failures = self.failures.lock();

        if *failures > 0 {
            *failures -= 1;

            return Err(IngestorError::ChildTimeout);
        }

        FixedResults.pull_results(benchmark)
    }
}

#[test]
fn failed_final_pull_is_retried_after_the_loop() {
    let gateway = Arc::new(MockGateway::new());
    let executor = MockExecutor::new(gateway.clone(), PathBuf::from("runs"));
    let mut notes = Vec::new();

    let report = run_campaign(
        vec![CampaignBenchmark::new("stream", 0)],
        &executor,
        &gateway,
        &FlakyResults::new(1),
        &settings(),
        |view| notes.extend(view.rows.iter().filter_map(|row| row.note.clone())),
    );

    assert_eq!(notes, ["results not pulled: Ingestor timeout"]);

    let BenchmarkOutcome::Extracted(Some(results)) = &report.benchmarks[0].outcome else {
        panic!("expected extracted results");
    };

    assert!(results.row("000000").is_some());
    assert_eq!(report.benchmarks[0].record.last_pull_error, None);
    assert_eq!(report.failed().count(), 0);
}

#[test]
fn unavailable_results_fail_the_benchmark_instead_of_mismatching() {
    let gateway = Arc::new(MockGateway::new());
    let executor = MockExecutor::new(gateway.clone(), PathBuf::from("runs"));
    let settings = CampaignSettings {
        reference: Some(BTreeMap::from([(
            "stream".to_owned(),
            serde_yaml::from_str("'000000': {gflops: 10}").unwrap(),
        )])),
        ..settings()
    };

    let report = run_campaign(
        vec![CampaignBenchmark::new("stream", 0)],
        &executor,
        &gateway,
        &FlakyResults::new(usize::MAX),
        &settings,
        |_| {},
    );

    let stream = &report.benchmarks[0];

    assert_eq!(stream.record.state, CampaignState::Finished);
    assert_eq!(
        stream.outcome,
        BenchmarkOutcome::Failed("results not pulled: Ingestor timeout".to_owned())
    );
    assert_eq!(report.failed().count(), 1);
}

#[test]
fn mock_gateway_is_a_status_gateway() {
    fn assert_gateway<G: StatusGateway>(_: &G) {}

    assert_gateway(&Arc::new(MockGateway::new()));
}
