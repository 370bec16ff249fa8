use crate::features::observability::repo::ObservabilityRepository;
use std::sync::Arc;

pub struct ObservabilityService {
    repo: Arc<ObservabilityRepository>,
}

impl ObservabilityService {
    pub fn new(repo: Arc<ObservabilityRepository>) -> Self {
        Self { repo }
    }

    pub fn record_poll_cycle(&self, scope: &str, outcome: &str) {
        self.repo.inc_poll_cycle(scope, outcome);
    }

    pub fn record_action(&self, action: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.repo.inc_action_dispatch(action, outcome);
    }

    pub fn record_task_poll(&self, outcome: &str) {
        self.repo.inc_task_poll(outcome);
    }

    pub fn set_snapshot_size(&self, count: usize) {
        self.repo.set_snapshot_resources(count as f64);
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        self.repo.render_metrics()
    }
}
