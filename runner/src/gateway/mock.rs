use super::{GatewayError, JobStates, StatusGateway};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// In-memory gateway replaying scripted job states.
///
/// Every query advances each requested job by one step of its script, the
/// last step repeats forever. Unscripted ids are absent from answers.
#[derive(Debug, Default)]
pub struct MockGateway {
    scripts: Mutex<BTreeMap<String, VecDeque<String>>>,
    outages: Mutex<usize>,
    calls: Mutex<usize>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script<I, S>(&self, job_id: impl Into<String>, states: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scripts
            .lock()
            .insert(job_id.into(), states.into_iter().map(Into::into).collect());
    }

    /// let the next `count` queries fail
    pub fn fail_next(&self, count: usize) {
        *self.outages.lock() += count;
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl StatusGateway for MockGateway {
    fn get_jobs_state(&self, job_ids: &BTreeSet<String>) -> Result<JobStates, GatewayError> {
        *self.calls.lock() += 1;

        {
            let mut outages = self.outages.lock();

            if *outages > 0 {
                *outages -= 1;
                debug!("Simulating scheduler outage");

                return Err(GatewayError::Unavailable("simulated outage".to_owned()));
            }
        }

        let mut scripts = self.scripts.lock();

        Ok(job_ids
            .iter()
            .filter_map(|id| {
                let script = scripts.get_mut(id)?;
                let state = if script.len() > 1 {
                    script.pop_front()?
                } else {
                    script.front()?.clone()
                };

                Some((id.clone(), state))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_scripts_and_repeats_last_state() {
        let gateway = MockGateway::new();
        gateway.script("1", ["PENDING", "RUNNING", "COMPLETED"]);
        let ids = BTreeSet::from(["1".to_owned(), "2".to_owned()]);

        let states = (0..4)
            .map(|_| gateway.get_jobs_state(&ids).unwrap())
            .map(|states| states.get("1").cloned().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(states, vec!["PENDING", "RUNNING", "COMPLETED", "COMPLETED"]);
        assert!(!gateway.get_jobs_state(&ids).unwrap().contains_key("2"));
        assert_eq!(gateway.calls(), 5);
    }

    #[test]
    fn outages_do_not_consume_script_steps() {
        let gateway = MockGateway::new();
        gateway.script("1", ["RUNNING", "COMPLETED"]);
        gateway.fail_next(1);
        let ids = BTreeSet::from(["1".to_owned()]);

        assert!(gateway.get_jobs_state(&ids).is_err());
        assert_eq!(gateway.get_jobs_state(&ids).unwrap()["1"], "RUNNING");
    }
}
