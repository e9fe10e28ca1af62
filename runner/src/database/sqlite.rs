use crate::{
    campaign::{BenchmarkOutcome, CampaignReport},
    database::ConnectionError,
};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection};
use std::{fmt::Debug, path::Path, sync::Arc};
use tracing::{debug, error, info};
use tracing_unwrap::ResultExt;

#[derive(Debug)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

impl From<rusqlite::Error> for ConnectionError {
    fn from(error: rusqlite::Error) -> Self {
        ConnectionError::SQLite(error)
    }
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock_mut(&mut self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        self.lock_mut().init()
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        Arc::try_unwrap(self.0).unwrap_or_log().into_inner().close()
    }

    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::load(path)?))
    }

    pub fn store(
        &self,
        report: &CampaignReport,
        comment: Option<&str>,
    ) -> Result<i64, ConnectionError> {
        self.lock().store(report, comment)
    }
}

fn outcome_label(outcome: &BenchmarkOutcome) -> &'static str {
    match outcome {
        BenchmarkOutcome::Failed(_) => "failed",
        BenchmarkOutcome::Compared(comparison) if comparison.is_match() => "matched",
        BenchmarkOutcome::Compared(_) => "mismatched",
        BenchmarkOutcome::Extracted(_) => "extracted",
    }
}

impl InnerConnection {
    pub fn init(&mut self) -> Result<(), ConnectionError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(ConnectionError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close connection, giving up");

                return Err(ConnectionError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        let connection = Connection::open(path)?;

        Ok(Self { connection })
    }

    /// store the whole report in one transaction
    pub fn store(
        &self,
        report: &CampaignReport,
        comment: Option<&str>,
    ) -> Result<i64, ConnectionError> {
        // NOTE: We can guarantee that no nested transactions are present due to only having one
        // connection at a time.
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        let campaign: i64 = tx
            .prepare_cached(
                "insert into campaigns
                 (comment, cycles) values (?, ?)
                 returning id",
            )?
            .query_row(params![comment.unwrap_or(""), report.cycles], |row| {
                row.get(0)
            })?;

        info!(id = campaign, "Created new campaign");

        let mut counter = 0;

        for benchmark in report.benchmarks.iter() {
            let record = &benchmark.record;
            let id: i64 = tx
                .prepare_cached(
                    "insert into benchmarks
                     (campaign, name, state, num_jobs, finished_jobs, failure, outcome, details)
                     values (?, ?, ?, ?, ?, ?, ?, ?)
                     returning id",
                )?
                .query_row(
                    params![
                        campaign,
                        record.benchmark.as_str(),
                        record.state as u8,
                        record.num_jobs,
                        record.finished_jobs,
                        record.failure.as_deref(),
                        outcome_label(&benchmark.outcome),
                        serde_yaml::to_string(&benchmark.outcome)?,
                    ],
                    |row| row.get(0),
                )?;

            for job in record.jobs.iter() {
                let result = job.result.as_ref().map(serde_yaml::to_string).transpose()?;

                tx.prepare_cached(
                    "insert into results
                     (benchmark, exec_dir, job_id, scheduler_state, result)
                     values (?, ?, ?, ?, ?)",
                )?
                .execute(params![
                    id,
                    job.exec_dir.to_string_lossy().as_ref(),
                    job.job_id.as_str(),
                    job.scheduler_state.as_str(),
                    result,
                ])?;

                counter += 1;
            }

            debug!(id = id, benchmark = %record.benchmark, "Inserted benchmark");
        }

        tx.commit()?;

        info!("Stored {} benchmarks with {counter} jobs", report.benchmarks.len());

        Ok(campaign)
    }
}

pub const SQL_SCHEMA: [&str; 3] = [
    "create table if not exists campaigns (
    id integer primary key,
    comment text,
    cycles integer not null,
    created text not null default current_timestamp
);",
    "create table if not exists benchmarks (
    id integer primary key,
    campaign integer not null references campaigns (id),
    name text not null,
    state tinyint not null,
    num_jobs integer,
    finished_jobs integer not null,
    failure text,
    outcome text not null,
    details text not null
);",
    "create table if not exists results (
    id integer primary key,
    benchmark integer not null references benchmarks (id),
    exec_dir text not null,
    job_id text not null,
    scheduler_state text not null,
    result text
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        campaign::BenchmarkReport,
        tracker::{CampaignState, CampaignStatusRecord, JobSnapshot},
    };
    use std::path::PathBuf;

    fn report() -> CampaignReport {
        let mut finished = CampaignStatusRecord::new("stream");
        finished.state = CampaignState::Finished;
        finished.num_jobs = Some(1);
        finished.finished_jobs = 1;
        finished.jobs.push(JobSnapshot {
            exec_dir: PathBuf::from("runs/stream/000000"),
            job_id: "4711".to_owned(),
            scheduler_state: "COMPLETED".to_owned(),
            result: None,
        });

        CampaignReport {
            cycles: 4,
            benchmarks: vec![
                BenchmarkReport {
                    record: finished,
                    outcome: BenchmarkOutcome::Extracted(None),
                },
                BenchmarkReport {
                    record: CampaignStatusRecord::failed("hpl", "sbatch: denied"),
                    outcome: BenchmarkOutcome::Failed("sbatch: denied".to_owned()),
                },
            ],
        }
    }

    fn count(connection: &SharedConnection, table: &str) -> i64 {
        connection
            .lock()
            .connection
            .query_row(&format!("select count(*) from {table}"), [], |row| {
                row.get(0)
            })
            .unwrap()
    }

    #[test]
    fn stores_reports() {
        let mut connection = SharedConnection::load(Path::new(":memory:")).unwrap();
        connection.init().unwrap();

        let first = connection.store(&report(), Some("nightly")).unwrap();
        let second = connection.store(&report(), None).unwrap();

        assert_ne!(first, second);
        assert_eq!(count(&connection, "campaigns"), 2);
        assert_eq!(count(&connection, "benchmarks"), 4);
        assert_eq!(count(&connection, "results"), 2);

        let (state, outcome): (u8, String) = connection
            .lock()
            .connection
            .query_row(
                "select state, outcome from benchmarks where name = 'hpl' limit 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(state, CampaignState::Init as u8);
        assert_eq!(outcome, "failed");

        connection.close().unwrap();
    }

    #[test]
    fn schema_is_reentrant() {
        let mut connection = SharedConnection::load(Path::new(":memory:")).unwrap();

        connection.init().unwrap();
        connection.init().unwrap();
    }
}
