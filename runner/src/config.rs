use crate::{
    campaign::{CampaignBenchmark, CampaignSettings},
    ingest::{IngestorError, ResultSnapshot},
    parameters::{nodes::NodeRequest, ParameterTable},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config {path:?}: {source}")]
    ReadConfig { path: PathBuf, source: Error },
    #[error("Failed to parse config: {0}")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Executor {0} not supported")]
    UnsupportedExecutor(String),
    #[error("Ingestor {0} not supported")]
    UnsupportedIngestor(String),
    #[error("Ingestor failed to load")]
    FailedLoadIngestor,
    #[error("Parameter {key} must be {expected}")]
    InvalidParameter { key: String, expected: &'static str },
    #[error("Value of {scope}.{name} can't be used as parameter expression")]
    InvalidExpression { scope: String, name: String },
    #[error("Failed to load reference results: {0}")]
    Reference(#[from] IngestorError),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    pub campaign: CampaignSection,
    // executor config, see Executors::load for the selection proccess
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub ingest: IngestorConfig,

    #[serde(alias = "db")]
    pub database: Option<DatabaseConfig>,

    #[serde(default)]
    pub platform: PlatformConfig,
    pub benchmarks: Vec<BenchmarkConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CampaignSection {
    /// seconds between two polling cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_outpath")]
    pub outpath: PathBuf,
    pub reference: Option<PathBuf>,
    pub comment: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct IngestorConfig {
    // Name of the selected ingestor type
    pub name: String,

    #[serde(default)]
    pub parameter: BTreeMap<String, serde_yaml::Value>,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            name: String::from("null"),
            parameter: BTreeMap::new(),
        }
    }
}

impl IngestorConfig {
    pub fn parameter_str(&self, key: &str) -> Result<Option<&str>, ConfigErrors> {
        parameter_str(Some(&self.parameter), key)
    }

    pub fn parameter_u64(&self, key: &str) -> Result<Option<u64>, ConfigErrors> {
        parameter_u64(Some(&self.parameter), key)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // Name of the selected executor, see Executors::load for the selection proccess
    pub name: String,
    // parameters for the executor that apply over all benchmarks
    pub parameter: Option<BTreeMap<String, serde_yaml::Value>>,
}

impl ExecutorConfig {
    pub fn parameter_str(&self, key: &str) -> Result<Option<&str>, ConfigErrors> {
        parameter_str(self.parameter.as_ref(), key)
    }

    pub fn parameter_u64(&self, key: &str) -> Result<Option<u64>, ConfigErrors> {
        parameter_u64(self.parameter.as_ref(), key)
    }
}

fn parameter_str<'a>(
    parameter: Option<&'a BTreeMap<String, serde_yaml::Value>>,
    key: &str,
) -> Result<Option<&'a str>, ConfigErrors> {
    match parameter.and_then(|parameter| parameter.get(key)) {
        None => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .ok_or_else(|| ConfigErrors::InvalidParameter {
                key: key.to_owned(),
                expected: "a string",
            }),
    }
}

fn parameter_u64(
    parameter: Option<&BTreeMap<String, serde_yaml::Value>>,
    key: &str,
) -> Result<Option<u64>, ConfigErrors> {
    match parameter.and_then(|parameter| parameter.get(key)) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| ConfigErrors::InvalidParameter {
                key: key.to_owned(),
                expected: "a natural number",
            }),
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    #[serde(default)]
    pub parameters: serde_yaml::Mapping,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkConfig {
    pub name: String,
    /// lower runs first, ties keep the declaration order
    #[serde(default)]
    pub priority: i64,
    pub template: Option<PathBuf>,
    #[serde(default)]
    pub parameters: serde_yaml::Mapping,
    #[serde(default)]
    pub custom_nodes: Vec<NodeRequest>,
}

/// textual form of a scalar, in the syntax the expression evaluator reads
fn expression_text(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => Some(String::new()),
        serde_yaml::Value::Bool(true) => Some(String::from("True")),
        serde_yaml::Value::Bool(false) => Some(String::from("False")),
        serde_yaml::Value::Number(number) => Some(number.to_string()),
        serde_yaml::Value::String(text) => Some(text.clone()),
        serde_yaml::Value::Tagged(tagged) => expression_text(&tagged.value),
        serde_yaml::Value::Sequence(_) | serde_yaml::Value::Mapping(_) => None,
    }
}

/// turn a YAML mapping into a parameter table, keeping the declaration order
pub fn parameter_table(
    scope: &str,
    mapping: &serde_yaml::Mapping,
) -> Result<ParameterTable, ConfigErrors> {
    mapping
        .iter()
        .map(|(name, value)| {
            let name = expression_text(name).unwrap_or_default();

            match expression_text(value) {
                Some(raw) if !name.is_empty() => Ok((name, raw)),
                _ => Err(ConfigErrors::InvalidExpression {
                    scope: scope.to_owned(),
                    name,
                }),
            }
        })
        .collect()
}

impl CampaignConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::ReadConfig {
            path: path.to_owned(),
            source,
        })?;

        Ok(serde_yaml::from_str(&content)?)
    }

    /// benchmarks in declaration order with their parameter tables
    pub fn benchmarks(&self) -> Result<Vec<CampaignBenchmark>, ConfigErrors> {
        self.benchmarks
            .iter()
            .map(|benchmark| {
                Ok(CampaignBenchmark {
                    name: benchmark.name.clone(),
                    priority: benchmark.priority,
                    template: benchmark.template.clone(),
                    parameters: parameter_table(
                        &format!("benchmarks.{}.parameters", benchmark.name),
                        &benchmark.parameters,
                    )?,
                    custom_nodes: benchmark.custom_nodes.clone(),
                })
            })
            .collect()
    }

    pub fn settings(&self) -> Result<CampaignSettings, ConfigErrors> {
        let reference = match &self.campaign.reference {
            Some(path) => Some(ResultSnapshot::load_references(path)?),
            None => None,
        };

        Ok(CampaignSettings {
            poll_interval: Duration::from_secs(self.campaign.poll_interval),
            platform: parameter_table("platform.parameters", &self.platform.parameters)?,
            reference,
            ..CampaignSettings::default()
        })
    }

    /// Report every problem of the config at once, returns whether any was found
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.benchmarks.is_empty() {
            error!("No benchmark was defined, the campaign would be empty");
            contains_error = true;
        }

        self.executor.name = self.executor.name.to_lowercase();

        if !["slurm", "local", "mock"].contains(&self.executor.name.as_str()) {
            error!(
                "executor.name ({}) is not supported, please use one of slurm, local or mock",
                self.executor.name
            );
            contains_error = true;
        }

        self.ingest.name = self.ingest.name.to_lowercase();

        match self.ingest.name.as_str() {
            "exec" => match self.ingest.parameter_str("exec") {
                Ok(Some(exec)) => match check_executable(Path::new(exec)) {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("ingest.parameter.exec ({exec}) is not executable");
                        contains_error = true;
                    }
                    Err(e) => {
                        error!("Failed to determine if ingest.parameter.exec ({exec}) is an executable: {e}");
                        contains_error = true;
                    }
                },
                _ => {
                    error!("ingest.parameter.exec must be a valid path to an executable file");
                    contains_error = true;
                }
            },
            "null" => {}
            ingestor_name => {
                error!("ingest.name ({ingestor_name}) is not supported, please use `exec` or `null`");
                contains_error = true;
            }
        }

        if self.campaign.poll_interval == 0 {
            warn!("campaign.poll_interval is 0, the scheduler will be polled without pause");
        }

        if let Some(reference) = &self.campaign.reference {
            if !reference.is_file() {
                error!("campaign.reference ({reference:?}) was not found");
                contains_error = true;
            }
        }

        let mut names = BTreeSet::new();

        for benchmark in self.benchmarks.iter() {
            let name = &benchmark.name;

            if !names.insert(name.as_str()) {
                error!("Benchmark {name} is defined more than once");
                contains_error = true;
            }

            if let Some(position) = benchmark
                .custom_nodes
                .iter()
                .position(|request| request.nodes == 0)
            {
                error!("benchmarks.{name}.custom_nodes[{position}] requests 0 nodes");
                contains_error = true;
            }

            match &benchmark.template {
                Some(template) if !template.is_file() => {
                    error!(
                        "Failed to find benchmarks.{name}.template. Either not a file or not found at {}",
                        template.to_string_lossy()
                    );
                    contains_error = true;
                }
                None if self.executor.name != "mock" => {
                    error!("benchmarks.{name}.template is required by the {} executor", self.executor.name);
                    contains_error = true;
                }
                _ => {}
            }

            if let Err(e) = parameter_table(name, &benchmark.parameters) {
                error!("{e}");
                contains_error = true;
            }
        }

        if let Err(e) = parameter_table("platform", &self.platform.parameters) {
            error!("{e}");
            contains_error = true;
        }

        let priorities = self
            .benchmarks
            .iter()
            .map(|benchmark| benchmark.priority)
            .duplicates()
            .collect_vec();

        if !priorities.is_empty() {
            warn!(
                "Priorities {} are shared by several benchmarks, they run in declaration order",
                priorities.iter().join(", ")
            );
        }

        contains_error
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("campaign.db")
}

fn default_outpath() -> PathBuf {
    PathBuf::from("runs")
}

fn default_poll_interval() -> u64 {
    30
}
