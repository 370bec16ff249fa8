use prometheus::{opts, Encoder, Gauge, IntCounterVec, Registry, TextEncoder};

pub struct ObservabilityRepository {
    registry: Registry,
    poll_cycles_total: IntCounterVec,
    action_dispatch_total: IntCounterVec,
    task_polls_total: IntCounterVec,
    snapshot_resources: Gauge,
}

impl ObservabilityRepository {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();

        let poll_cycles_total = IntCounterVec::new(
            opts!(
                "vmsync_poll_cycles_total",
                "Resource poll cycles by scope and outcome"
            ),
            &["scope", "outcome"],
        )
        .map_err(|e| e.to_string())?;
        let action_dispatch_total = IntCounterVec::new(
            opts!(
                "vmsync_action_dispatch_total",
                "Resource actions dispatched to the backend"
            ),
            &["action", "outcome"],
        )
        .map_err(|e| e.to_string())?;
        let task_polls_total = IntCounterVec::new(
            opts!("vmsync_task_polls_total", "Task status polls by outcome"),
            &["outcome"],
        )
        .map_err(|e| e.to_string())?;
        let snapshot_resources = Gauge::with_opts(opts!(
            "vmsync_snapshot_resources",
            "Resources in the most recently merged snapshot"
        ))
        .map_err(|e| e.to_string())?;

        registry
            .register(Box::new(poll_cycles_total.clone()))
            .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(action_dispatch_total.clone()))
            .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(task_polls_total.clone()))
            .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(snapshot_resources.clone()))
            .map_err(|e| e.to_string())?;

        Ok(Self {
            registry,
            poll_cycles_total,
            action_dispatch_total,
            task_polls_total,
            snapshot_resources,
        })
    }

    pub fn inc_poll_cycle(&self, scope: &str, outcome: &str) {
        self.poll_cycles_total
            .with_label_values(&[scope, outcome])
            .inc();
    }

    pub fn inc_action_dispatch(&self, action: &str, outcome: &str) {
        self.action_dispatch_total
            .with_label_values(&[action, outcome])
            .inc();
    }

    pub fn inc_task_poll(&self, outcome: &str) {
        self.task_polls_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_snapshot_resources(&self, count: f64) {
        self.snapshot_resources.set(count);
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buffer).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render_with_labels() {
        let repo = ObservabilityRepository::new().unwrap();
        repo.inc_poll_cycle("list", "merged");
        repo.inc_poll_cycle("list", "merged");
        repo.inc_action_dispatch("stop", "failure");

        let rendered = repo.render_metrics().unwrap();
        let poll_line = rendered
            .lines()
            .find(|line| line.starts_with("vmsync_poll_cycles_total{"))
            .unwrap();
        assert!(poll_line.contains(r#"scope="list""#));
        assert!(poll_line.ends_with(" 2"));

        let action_line = rendered
            .lines()
            .find(|line| line.starts_with("vmsync_action_dispatch_total{"))
            .unwrap();
        assert!(action_line.contains(r#"action="stop""#));
        assert!(action_line.contains(r#"outcome="failure""#));
    }
}
