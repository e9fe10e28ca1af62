use super::{GatewayError, JobStates, StatusGateway};
use crate::process::PipeReader;
use itertools::Itertools;
use std::{
    collections::BTreeSet,
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

/// Gateway asking `sacct` for the state of submitted jobs
#[derive(Debug, Clone)]
pub struct SlurmGateway {
    pub command: PathBuf,
    pub timeout: Duration,
}

impl Default for SlurmGateway {
    fn default() -> Self {
        Self {
            command: PathBuf::from("sacct"),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Parse `sacct -n -P -o JobID,State` output.
///
/// States like `CANCELLED by 1234` are cut down to their first word. Repeated
/// ids (e.g. requeued jobs) keep the last reported state.
pub fn parse_sacct(output: &str) -> JobStates {
    output
        .lines()
        .filter_map(|line| line.split_once('|'))
        .filter_map(|(id, state)| {
            let id = id.trim();
            let state = state.split_whitespace().next()?;

            (!id.is_empty()).then(|| (id.to_owned(), state.to_owned()))
        })
        .collect()
}

impl StatusGateway for SlurmGateway {
    #[tracing::instrument(level = "debug", skip(self, job_ids), fields(jobs = job_ids.len()))]
    fn get_jobs_state(&self, job_ids: &BTreeSet<String>) -> Result<JobStates, GatewayError> {
        if job_ids.is_empty() {
            return Ok(JobStates::new());
        }

        let mut handle = Command::new(&self.command)
            .args(["-n", "-P", "-X", "-o", "JobID,State", "-j"])
            .arg(job_ids.iter().join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| GatewayError::Spawn(error.to_string()))?;

        let stdout = PipeReader::spawn(handle.stdout.take());
        let stderr = PipeReader::spawn(handle.stderr.take());

        let status = match handle.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(command = ?self.command, "Status command ran into timeout");

                if let Err(error) = handle.kill() {
                    debug!(error = ?error, "Failed to kill status command");
                }
                // reap the killed child, the readers are left to finish on their own
                handle.wait().ok();

                return Err(GatewayError::Timeout(self.timeout));
            }
            Err(error) => return Err(GatewayError::Unavailable(error.to_string())),
        };

        let stdout = stdout
            .join()
            .map_err(|error| GatewayError::Unavailable(error.to_string()))?;

        if !status.success() {
            let stderr = stderr.join().unwrap_or_default();

            return Err(GatewayError::Command(format!(
                "{status}: {}",
                stderr.trim()
            )));
        }

        trace!(output = %stdout, "sacct output");

        Ok(parse_sacct(&stdout))
    }
}
