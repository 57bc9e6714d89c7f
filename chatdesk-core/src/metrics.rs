// ABOUTME: Metric recording helpers for the routing core
// ABOUTME: Thin wrappers over the metrics crate so call sites stay one-liners

use metrics::{counter, histogram};
use std::time::Duration;

pub fn record_command(verb: &str) {
    counter!("chatdesk_commands_total", "verb" => verb.to_string()).increment(1);
}

pub fn record_distribution(method: &str) {
    counter!("chatdesk_distributions_total", "method" => method.to_string()).increment(1);
}

pub fn record_no_agents(queue_id: &str) {
    counter!("chatdesk_no_agents_total", "queue" => queue_id.to_string()).increment(1);
}

pub fn record_escalation(queue_id: &str) {
    counter!("chatdesk_escalations_total", "queue" => queue_id.to_string()).increment(1);
}

pub fn record_side_effect_failure(action: &str) {
    counter!("chatdesk_side_effect_failures_total", "action" => action.to_string()).increment(1);
}

pub fn record_pending_wait(duration: Duration) {
    histogram!("chatdesk_pending_wait_seconds").record(duration.as_secs_f64());
}
