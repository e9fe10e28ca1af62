use super::{
    template, DispatchError, DispatchProbe, DispatchProgress, DispatchRequest, Dispatcher,
    RunHandle,
};
use crate::{
    config::{ConfigErrors, ExecutorConfig},
    gateway::slurm::SlurmGateway,
    parameters::nodes::SUBMIT_VARIABLE,
};
use std::{
    collections::BTreeMap,
    io::Read,
    path::PathBuf,
    process::{Child, Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Executor submitting one `sbatch` job per workpackage
#[derive(Debug)]
pub struct SlurmExecutor {
    pub submit: PathBuf,
    /// used for workpackages without custom submit arguments
    pub default_args: Vec<String>,
    outpath: PathBuf,
    gateway: SlurmGateway,
}

impl SlurmExecutor {
    pub fn new(outpath: PathBuf) -> Self {
        Self {
            submit: PathBuf::from("sbatch"),
            default_args: Vec::new(),
            outpath,
            gateway: SlurmGateway::default(),
        }
    }

    pub fn load(config: &ExecutorConfig, outpath: PathBuf) -> Result<Self, ConfigErrors> {
        let mut executor = Self::new(outpath);

        if let Some(submit) = config.parameter_str("submit")? {
            executor.submit = PathBuf::from(submit);
        }
        if let Some(status) = config.parameter_str("status")? {
            executor.gateway.command = PathBuf::from(status);
        }
        if let Some(args) = config.parameter_str("args")? {
            executor.default_args = args.split_whitespace().map(str::to_owned).collect();
        }
        // milliseconds, like the ingestor timeout
        if let Some(timeout) = config.parameter_u64("status_timeout")? {
            executor.gateway.timeout = Duration::from_millis(timeout);
        }

        Ok(executor)
    }

    pub fn gateway(&self) -> SlurmGateway {
        self.gateway.clone()
    }
}

/// Job id from `sbatch --parsable` output, which is `<id>[;<cluster>]`
pub fn parse_job_id(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    let id = line.split(';').next()?.trim();

    (!id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        .then(|| id.to_owned())
}

/// Probe over the `sbatch` processes of one benchmark
#[derive(Debug)]
pub struct SubmissionProbe {
    running: Vec<(PathBuf, Child)>,
    submitted: BTreeMap<PathBuf, String>,
    failures: Vec<String>,
}

impl SubmissionProbe {
    fn finish(exec_dir: PathBuf, mut child: Child, success: bool) -> Result<String, String> {
        let mut stdout = String::new();
        let mut stderr = String::new();

        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout).ok();
        }
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr).ok();
        }

        if !success {
            return Err(format!("{exec_dir:?}: {}", stderr.trim()));
        }

        parse_job_id(&stdout)
            .ok_or_else(|| format!("{exec_dir:?}: unexpected sbatch output {stdout:?}"))
    }
}

impl DispatchProbe for SubmissionProbe {
    fn poll(&mut self) -> DispatchProgress {
        let mut running = Vec::with_capacity(self.running.len());

        for (exec_dir, mut child) in self.running.drain(..) {
            let success = match child.try_wait() {
                Ok(Some(status)) => status.success(),
                Ok(None) => {
                    running.push((exec_dir, child));
                    continue;
                }
                Err(error) => {
                    self.failures.push(format!("{exec_dir:?}: {error}"));
                    continue;
                }
            };

            match Self::finish(exec_dir.clone(), child, success) {
                Ok(job_id) => {
                    debug!(job = %job_id, exec_dir = ?exec_dir, "Submitted");
                    self.submitted.insert(exec_dir, job_id);
                }
                Err(reason) => self.failures.push(reason),
            }
        }

        self.running = running;

        if !self.running.is_empty() {
            DispatchProgress::Pending
        } else if !self.failures.is_empty() {
            DispatchProgress::Failed(self.failures.join("; "))
        } else {
            DispatchProgress::Submitted(std::mem::take(&mut self.submitted))
        }
    }
}

impl Dispatcher for SlurmExecutor {
    #[instrument(level = "debug", skip_all, fields(benchmark = request.benchmark))]
    fn dispatch(&self, request: DispatchRequest<'_>) -> Result<RunHandle, DispatchError> {
        let template = request
            .template
            .ok_or_else(|| DispatchError::MissingTemplate(request.benchmark.to_owned()))?;
        let mut running = Vec::with_capacity(request.workpackages.len());

        for workpackage in request.workpackages {
            let exec_dir = request.exec_dir(&self.outpath, workpackage);
            let script = template::materialize(&exec_dir, template, workpackage)?;
            let args = match workpackage.get(SUBMIT_VARIABLE) {
                Some(custom) => custom.split_whitespace().map(str::to_owned).collect(),
                None => self.default_args.clone(),
            };

            let child = Command::new(&self.submit)
                .arg("--parsable")
                .args(&args)
                .arg(&script)
                .current_dir(&exec_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn();

            match child {
                Ok(child) => running.push((exec_dir, child)),
                Err(source) => {
                    warn!(command = ?self.submit, "Failed to start submission");

                    // don't leave half a benchmark behind unobserved
                    for (_, mut child) in running {
                        child.kill().ok();
                        child.wait().ok();
                    }

                    return Err(DispatchError::Spawn {
                        command: self.submit.clone(),
                        source,
                    });
                }
            }
        }

        info!(jobs = running.len(), "Submitting to slurm");

        Ok(RunHandle::new(Box::new(SubmissionProbe {
            running,
            submitted: BTreeMap::new(),
            failures: Vec::new(),
        })))
    }
}
