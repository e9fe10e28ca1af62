use super::{template, DispatchError, DispatchRequest, Dispatcher, RunHandle};
use crate::{
    config::{ConfigErrors, ExecutorConfig},
    gateway::{GatewayError, JobStates, StatusGateway},
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::Arc,
};
use tracing::{debug, info, instrument, warn};

#[derive(Debug)]
enum LocalJob {
    Running(Child),
    Exited(bool),
}

/// Children spawned by a [`LocalExecutor`], keyed by their job id
#[derive(Debug, Clone, Default)]
struct ProcessTable(Arc<Mutex<BTreeMap<String, LocalJob>>>);

/// Executor running job scripts as child processes of the runner
#[derive(Debug)]
pub struct LocalExecutor {
    shell: PathBuf,
    outpath: PathBuf,
    processes: ProcessTable,
}

impl LocalExecutor {
    pub fn new(outpath: PathBuf) -> Self {
        Self {
            shell: PathBuf::from("sh"),
            outpath,
            processes: ProcessTable::default(),
        }
    }

    pub fn load(config: &ExecutorConfig, outpath: PathBuf) -> Result<Self, ConfigErrors> {
        let mut executor = Self::new(outpath);

        if let Some(shell) = config.parameter_str("shell")? {
            executor.shell = PathBuf::from(shell);
        }

        Ok(executor)
    }

    pub fn gateway(&self) -> LocalGateway {
        LocalGateway {
            processes: self.processes.clone(),
        }
    }
}

impl Dispatcher for LocalExecutor {
    #[instrument(level = "debug", skip_all, fields(benchmark = request.benchmark))]
    fn dispatch(&self, request: DispatchRequest<'_>) -> Result<RunHandle, DispatchError> {
        let template = request
            .template
            .ok_or_else(|| DispatchError::MissingTemplate(request.benchmark.to_owned()))?;
        let mut exec_dir_map = BTreeMap::new();

        for workpackage in request.workpackages {
            let exec_dir = request.exec_dir(&self.outpath, workpackage);
            let script = template::materialize(&exec_dir, template, workpackage)?;
            let exec_dir_error = |source| DispatchError::ExecDir {
                path: exec_dir.clone(),
                source,
            };

            let stdout = File::create(exec_dir.join("stdout")).map_err(exec_dir_error)?;
            let stderr = File::create(exec_dir.join("stderr")).map_err(exec_dir_error)?;

            let child = Command::new(&self.shell)
                .arg(&script)
                .current_dir(&exec_dir)
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(stderr)
                .spawn()
                .map_err(|source| DispatchError::Spawn {
                    command: self.shell.clone(),
                    source,
                })?;
            let job_id = format!("local-{}", child.id());

            debug!(job = %job_id, exec_dir = ?exec_dir, "Started job");

            self.processes
                .0
                .lock()
                .insert(job_id.clone(), LocalJob::Running(child));
            exec_dir_map.insert(exec_dir, job_id);
        }

        info!(jobs = exec_dir_map.len(), "Started local jobs");

        Ok(RunHandle::submitted(exec_dir_map))
    }
}

/// Gateway reporting the state of locally spawned jobs
#[derive(Debug, Clone)]
pub struct LocalGateway {
    processes: ProcessTable,
}

impl StatusGateway for LocalGateway {
    fn get_jobs_state(&self, job_ids: &BTreeSet<String>) -> Result<JobStates, GatewayError> {
        let mut processes = self.processes.0.lock();
        let mut states = JobStates::new();

        for id in job_ids {
            let Some(job) = processes.get_mut(id) else {
                continue;
            };

            if let LocalJob::Running(child) = job {
                match child.try_wait() {
                    Ok(Some(status)) => *job = LocalJob::Exited(status.success()),
                    Ok(None) => {}
                    Err(error) => {
                        warn!(job = %id, error = %error, "Failed to query child");

                        return Err(GatewayError::Unavailable(error.to_string()));
                    }
                }
            }

            let state = match job {
                LocalJob::Running(_) => "RUNNING",
                LocalJob::Exited(true) => "COMPLETED",
                LocalJob::Exited(false) => "FAILED",
            };

            states.insert(id.clone(), state.to_owned());
        }

        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        executors::{RunStatus, Workpackage},
        gateway::is_terminal,
    };
    use std::{fs, thread, time::Duration};

    fn wait_for_terminal(gateway: &LocalGateway, ids: &BTreeSet<String>) -> JobStates {
        for _ in 0..200 {
            let states = gateway.get_jobs_state(ids).unwrap();

            if states.values().all(|state| is_terminal(state)) {
                return states;
            }

            thread::sleep(Duration::from_millis(25));
        }

        panic!("local jobs did not finish");
    }

    #[cfg(unix)]
    #[test]
    fn runs_templates_in_exec_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("job.tmpl");
        fs::write(&template, "echo $greeting > out.txt\nexit $code\n").unwrap();

        let executor = LocalExecutor::new(dir.path().join("runs"));
        let workpackages = [
            Workpackage {
                index: 0,
                parameters: vec![
                    ("greeting".to_owned(), "hello".to_owned()),
                    ("code".to_owned(), "0".to_owned()),
                ],
            },
            Workpackage {
                index: 1,
                parameters: vec![
                    ("greeting".to_owned(), "bye".to_owned()),
                    ("code".to_owned(), "3".to_owned()),
                ],
            },
        ];

        let mut handle = executor
            .dispatch(DispatchRequest {
                benchmark: "echo",
                template: Some(&template),
                workpackages: &workpackages,
            })
            .unwrap();

        assert_eq!(handle.status(), RunStatus::Success);

        let ids = handle.job_ids().cloned().unwrap();
        let states = wait_for_terminal(&executor.gateway(), &ids);
        let by_dir = handle
            .exec_dir_map()
            .iter()
            .map(|(dir, id)| (dir.file_name().unwrap().to_owned(), states[id].clone()))
            .collect::<BTreeMap<_, _>>();

        assert_eq!(by_dir[std::ffi::OsStr::new("000000")], "COMPLETED");
        assert_eq!(by_dir[std::ffi::OsStr::new("000001")], "FAILED");
        assert_eq!(
            fs::read_to_string(dir.path().join("runs/echo/000000/out.txt")).unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn refuses_benchmarks_without_template() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new(dir.path().to_owned());
        let workpackage = Workpackage {
            index: 0,
            parameters: Vec::new(),
        };

        assert!(matches!(
            executor.dispatch(DispatchRequest {
                benchmark: "bare",
                template: None,
                workpackages: std::slice::from_ref(&workpackage),
            }),
            Err(DispatchError::MissingTemplate(name)) if name == "bare"
        ));
    }

    #[test]
    fn unknown_ids_are_absent() {
        let gateway = LocalExecutor::new(PathBuf::from("runs")).gateway();

        assert!(gateway
            .get_jobs_state(&BTreeSet::from(["local-1".to_owned()]))
            .unwrap()
            .is_empty());
    }
}
