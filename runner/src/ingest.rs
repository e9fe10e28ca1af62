pub mod exec;

use crate::config::{ConfigErrors, IngestorConfig};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum IngestorError {
    #[error("Failed to spawn ingestor: {0}")]
    SpawnIngestor(std::io::Error),
    #[error("Failed to deserialize ingestor output: {0}")]
    DeserializeIngestor(#[from] serde_yaml::Error),
    #[error("Failed to wait for a child proccess: {0}")]
    ChildError(#[from] std::io::Error),
    #[error("Ingestor timeout")]
    ChildTimeout,
    #[error("Ingestor exited with {0}")]
    ChildFailed(String),
    #[error("Failed to read reference results {0:?}: {1}")]
    Reference(PathBuf, std::io::Error),
}

/// Results of one benchmark: execution directory -> column -> value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultSnapshot(pub BTreeMap<String, BTreeMap<String, serde_yaml::Value>>);

impl ResultSnapshot {
    pub fn row(&self, exec_dir: &str) -> Option<&BTreeMap<String, serde_yaml::Value>> {
        self.0.get(exec_dir)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `rows x columns` for the status view
    pub fn summary(&self) -> String {
        let columns = self
            .0
            .values()
            .flat_map(BTreeMap::keys)
            .collect::<std::collections::BTreeSet<_>>()
            .len();

        format!("{} rows x {columns} columns", self.0.len())
    }

    /// reference results as written by a previous campaign, keyed by benchmark
    pub fn load_references(path: &Path) -> Result<ReferenceResults, IngestorError> {
        let content = fs::read_to_string(path)
            .map_err(|error| IngestorError::Reference(path.to_owned(), error))?;

        Ok(serde_yaml::from_str(&content)?)
    }
}

pub type ReferenceResults = BTreeMap<String, ResultSnapshot>;

/// Pulls the current results of a benchmark
pub trait ResultPuller: Sync {
    fn pull_results(&self, benchmark: &str) -> Result<ResultSnapshot, IngestorError>;
}

#[derive(Clone, Debug)]
pub enum Ingestors {
    Exec(exec::ExecIngestor),
    Null,
}

impl Ingestors {
    pub fn load(config: &IngestorConfig, outpath: PathBuf) -> Result<Self, ConfigErrors> {
        match config.name.as_str() {
            "null" => Ok(Self::Null),
            "exec" => exec::ExecIngestor::load(config, outpath).map(Ingestors::Exec),
            name => Err(ConfigErrors::UnsupportedIngestor(name.to_owned())),
        }
    }
}

impl ResultPuller for Ingestors {
    #[tracing::instrument(level = "debug", skip(self))]
    fn pull_results(&self, benchmark: &str) -> Result<ResultSnapshot, IngestorError> {
        match self {
            Self::Exec(ingestor) => ingestor.pull_results(benchmark).map_err(|error| {
                error!(benchmark, error = %error, "Failed to pull results");

                error
            }),
            Self::Null => {
                debug!(benchmark, "Null ingestor, no results");

                Ok(ResultSnapshot::default())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub exec_dir: String,
    pub column: String,
    pub expected: serde_yaml::Value,
    pub actual: serde_yaml::Value,
}

/// Outcome of checking results against a reference
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Comparison {
    pub matched: usize,
    pub mismatched: Vec<Mismatch>,
    /// `exec_dir/column` entries of the reference without an actual value
    pub missing: Vec<String>,
}

impl Comparison {
    pub fn is_match(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

/// compare every reference cell with its actual counterpart
pub fn compare(reference: &ResultSnapshot, actual: &ResultSnapshot) -> Comparison {
    let mut comparison = Comparison::default();

    for (exec_dir, columns) in reference.0.iter() {
        let row = actual.row(exec_dir);

        for (column, expected) in columns {
            match row.and_then(|row| row.get(column)) {
                Some(value) if value == expected => comparison.matched += 1,
                Some(value) => comparison.mismatched.push(Mismatch {
                    exec_dir: exec_dir.clone(),
                    column: column.clone(),
                    expected: expected.clone(),
                    actual: value.clone(),
                }),
                None => comparison.missing.push(format!("{exec_dir}/{column}")),
            }
        }
    }

    comparison
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(yaml: &str) -> ResultSnapshot {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn compares_cell_by_cell() {
        let reference = snapshot("000000: {gflops: 12.5, status: ok}\n000001: {gflops: 3}\n");
        let actual = snapshot("000000: {gflops: 12.5, status: failed}\n");

        let comparison = compare(&reference, &actual);

        assert_eq!(comparison.matched, 1);
        assert_eq!(comparison.mismatched.len(), 1);
        assert_eq!(comparison.mismatched[0].column, "status");
        assert_eq!(comparison.missing, vec!["000001/gflops".to_owned()]);
        assert!(!comparison.is_match());
    }

    #[test]
    fn extra_actual_columns_are_ignored() {
        let reference = snapshot("000000: {gflops: 1}\n");
        let actual = snapshot("000000: {gflops: 1, time: 3.2}\n");

        assert!(compare(&reference, &actual).is_match());
    }

    #[test]
    fn summary_counts_distinct_columns() {
        let results = snapshot("a: {x: 1, y: 2}\nb: {x: 3, z: 4}\n");

        assert_eq!(results.summary(), "2 rows x 3 columns");
    }

    #[test]
    fn null_ingestor_is_empty() {
        assert!(Ingestors::Null.pull_results("stream").unwrap().is_empty());
    }
}
