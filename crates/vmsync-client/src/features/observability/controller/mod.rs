use crate::features::observability::repo::ObservabilityRepository;
use crate::features::observability::service::ObservabilityService;
use std::sync::{Arc, OnceLock};

pub struct ObservabilityController {
    service: ObservabilityService,
}

impl ObservabilityController {
    pub fn new(service: ObservabilityService) -> Self {
        Self { service }
    }

    pub fn record_poll_cycle(&self, scope: &str, outcome: &str) {
        self.service.record_poll_cycle(scope, outcome);
    }

    pub fn record_action(&self, action: &str, success: bool) {
        self.service.record_action(action, success);
    }

    pub fn record_task_poll(&self, outcome: &str) {
        self.service.record_task_poll(outcome);
    }

    pub fn set_snapshot_size(&self, count: usize) {
        self.service.set_snapshot_size(count);
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        self.service.render_metrics()
    }
}

static GLOBAL_OBSERVABILITY: OnceLock<Arc<ObservabilityController>> = OnceLock::new();

pub fn global_observability_controller() -> Arc<ObservabilityController> {
    GLOBAL_OBSERVABILITY
        .get_or_init(|| {
            // Registration on a fresh registry only fails on duplicate names.
            let repo = Arc::new(ObservabilityRepository::new().expect("metrics init"));
            Arc::new(ObservabilityController::new(ObservabilityService::new(
                repo,
            )))
        })
        .clone()
}
