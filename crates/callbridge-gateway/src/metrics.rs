//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
///
/// Only one recorder can be installed per process.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))
}

/// Record an answered call.
pub fn record_call_answered() {
    metrics::counter!("calls_answered_total").increment(1);
    metrics::gauge!("calls_active").increment(1.0);
}

/// Record a call leaving the registry.
pub fn record_call_ended() {
    metrics::gauge!("calls_active").decrement(1.0);
}

/// Record a media command issued to the call (`play` or `listen`).
pub fn record_command(command: &str) {
    let labels = [("command", command.to_string())];
    metrics::counter!("media_commands_total", &labels).increment(1);
}

/// Record caller input forwarded to the bot (`speech` or `dtmf`).
pub fn record_utterance(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("utterances_total", &labels).increment(1);
}

/// Record a call event received on the callback endpoint.
pub fn record_call_event(event: &str) {
    let labels = [("event", event.to_string())];
    metrics::counter!("call_events_total", &labels).increment(1);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_prometheus_recorder() {
        let handle = install_prometheus_recorder().unwrap();
        record_command("play");
        let output = handle.render();
        assert!(output.contains("media_commands_total"));
    }

    #[test]
    fn test_recorders_without_exporter_do_not_panic() {
        // metrics falls back to a no-op recorder
        record_call_answered();
        record_call_ended();
        record_utterance("dtmf");
        record_call_event("play_completed");
        record_error("remote_command");
    }
}
