use super::{IngestorError, ResultSnapshot};
use crate::{
    config::{ConfigErrors, IngestorConfig},
    process::PipeReader,
};
use std::{
    ffi::OsString,
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, error, warn};
use wait_timeout::ChildExt;

/// Ingestor running a user command that prints the results of a benchmark
/// as YAML. It is called as `<exec> [params] <benchmark> <outpath>`.
#[derive(Debug, Clone)]
pub struct ExecIngestor {
    pub ingestor: OsString,
    pub params: Vec<String>,
    pub timeout: Duration,
    pub outpath: PathBuf,
}

impl ExecIngestor {
    pub fn load(config: &IngestorConfig, outpath: PathBuf) -> Result<Self, ConfigErrors> {
        let Some(exec) = config.parameter_str("exec")? else {
            error!("The exec ingestor requires ingest.parameter.exec to be a str pointing to the path of the ingestor script");

            return Err(ConfigErrors::FailedLoadIngestor);
        };

        let timeout = Duration::from_millis(config.parameter_u64("timeout")?.unwrap_or(2000));
        let params = config
            .parameter_str("params")?
            .map(|params| params.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();

        Ok(Self {
            ingestor: OsString::from(exec),
            params,
            timeout,
            outpath,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn pull_results(&self, benchmark: &str) -> Result<ResultSnapshot, IngestorError> {
        let mut handle = Command::new(&self.ingestor)
            .args(&self.params)
            .arg(benchmark)
            .arg(&self.outpath)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // a closed stdin gives ingestors a clear end of input
            .stdin(Stdio::null())
            .spawn()
            .map_err(IngestorError::SpawnIngestor)?;

        debug!("Ingestor waiting on {}", handle.id());

        let stdout = PipeReader::spawn(handle.stdout.take());
        let stderr = PipeReader::spawn(handle.stderr.take());

        let status = match handle.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                warn!("Ingestor ran into timeout");

                handle.kill().ok();
                handle.wait().ok();

                return Err(IngestorError::ChildTimeout);
            }
        };

        if !status.success() {
            let stderr_buffer = stderr.join().unwrap_or_default();

            debug!(stderr = stderr_buffer, "Ingestor failed");

            return Err(IngestorError::ChildFailed(status.to_string()));
        }

        let buffer = stdout.join()?;

        debug!("Output from ingestor: {buffer}");

        if buffer.trim().is_empty() {
            return Ok(ResultSnapshot::default());
        }

        serde_yaml::from_str::<ResultSnapshot>(&buffer).map_err(|e| {
            error!("Ingestor failed to read results: {e}");

            e.into()
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt, path::Path};

    fn script(dir: &Path, body: &str) -> OsString {
        let path = dir.join("collect.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        path.into_os_string()
    }

    fn ingestor(dir: &Path, body: &str) -> ExecIngestor {
        ExecIngestor {
            ingestor: script(dir, body),
            params: Vec::new(),
            timeout: Duration::from_secs(5),
            outpath: dir.join("runs"),
        }
    }

    #[test]
    fn parses_yaml_output() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = ingestor(dir.path(), "echo \"000000: {bench: $1, gflops: 7}\"");

        let results = ingestor.pull_results("hpl").unwrap();
        let row = results.row("000000").unwrap();

        assert_eq!(row["bench"], serde_yaml::Value::from("hpl"));
        assert_eq!(row["gflops"], serde_yaml::Value::from(7));
    }

    #[test]
    fn failing_ingestor_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = ingestor(dir.path(), "echo broken >&2\nexit 2");

        assert!(matches!(
            ingestor.pull_results("hpl"),
            Err(IngestorError::ChildFailed(_))
        ));
    }

    #[test]
    fn large_output_is_read_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = ingestor(
            dir.path(),
            "i=0\nwhile [ $i -lt 3000 ]; do printf '%06d: {gflops: %d, note: padding-padding}\\n' $i $i; i=$((i+1)); done",
        );

        let results = ingestor.pull_results("hpl").unwrap();

        assert_eq!(results.0.len(), 3000);
        assert_eq!(
            results.row("002999").unwrap()["gflops"],
            serde_yaml::Value::from(2999)
        );
    }

    #[test]
    fn slow_ingestor_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut ingestor = ingestor(dir.path(), "sleep 5");
        ingestor.timeout = Duration::from_millis(100);

        assert!(matches!(
            ingestor.pull_results("hpl"),
            Err(IngestorError::ChildTimeout)
        ));
    }
}
