// Prometheus metrics for the hyperpod daemon
//
// Exposed on the /metrics HTTP endpoint:
// - VM launches and start failures per driver (counter)
// - hub events per event name (counter)
// - QMP sessions, commands and retries (counter, histogram)
// - device hotplug outcomes (counter)
// - active port mappings (gauge)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // VM lifecycle
    pub static ref VMS_LAUNCHED_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("vms_launched_total", "Total number of VMs launched"),
        &["driver"]
    ).expect("Failed to create VMs launched metric");

    pub static ref VM_START_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("vm_start_failures_total", "Total number of VM start failures"),
        &["driver"]
    ).expect("Failed to create VM start failures metric");

    pub static ref HUB_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("hub_events_total", "Total number of events posted to VM hubs"),
        &["event"]
    ).expect("Failed to create hub events metric");

    // QMP
    pub static ref QMP_SESSIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("qmp_sessions_total", "Total number of QMP sessions"),
        &["status"]
    ).expect("Failed to create QMP sessions metric");

    pub static ref QMP_COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("qmp_commands_total", "Total number of QMP commands executed"),
        &["command", "status"]
    ).expect("Failed to create QMP commands metric");

    pub static ref QMP_COMMAND_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "qmp_command_retries_total",
        "Total number of QMP command retries"
    ).expect("Failed to create QMP retries metric");

    pub static ref QMP_SESSION_DURATION_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("qmp_session_duration_seconds", "Duration of QMP sessions"),
    ).expect("Failed to create QMP session duration metric");

    // Devices
    pub static ref HOTPLUG_OPERATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("hotplug_operations_total", "Total number of device hotplug operations"),
        &["device", "status"]
    ).expect("Failed to create hotplug operations metric");

    // Networking
    pub static ref PORT_MAPPINGS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        prometheus::Opts::new("port_mappings_active", "Number of allocated host ports"),
        &["protocol"]
    ).expect("Failed to create port mappings metric");

    pub static ref PORT_MAPPING_REVERT_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "port_mapping_revert_failures_total",
        "Total number of port mapping rules that could not be reverted"
    ).expect("Failed to create revert failures metric");
}

fn register<C: prometheus::core::Collector + 'static>(collector: C) -> prometheus::Result<()> {
    match REGISTRY.register(Box::new(collector)) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Register every metric. Calling it again is harmless.
pub fn init() -> prometheus::Result<()> {
    register(VMS_LAUNCHED_TOTAL.clone())?;
    register(VM_START_FAILURES_TOTAL.clone())?;
    register(HUB_EVENTS_TOTAL.clone())?;
    register(QMP_SESSIONS_TOTAL.clone())?;
    register(QMP_COMMANDS_TOTAL.clone())?;
    register(QMP_COMMAND_RETRIES_TOTAL.clone())?;
    register(QMP_SESSION_DURATION_SECONDS.clone())?;
    register(HOTPLUG_OPERATIONS_TOTAL.clone())?;
    register(PORT_MAPPINGS_ACTIVE.clone())?;
    register(PORT_MAPPING_REVERT_FAILURES_TOTAL.clone())?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init().unwrap();
        init().unwrap();
    }

    #[test]
    fn test_gather_includes_labelled_counters() {
        init().unwrap();
        VMS_LAUNCHED_TOTAL.with_label_values(&["qemu"]).inc();
        HOTPLUG_OPERATIONS_TOTAL
            .with_label_values(&["disk", "ok"])
            .inc();
        let text = gather_metrics().unwrap();
        assert!(text.contains("vms_launched_total{driver=\"qemu\"}"));
        assert!(text.contains("hotplug_operations_total{device=\"disk\",status=\"ok\"}"));
    }

    #[test]
    fn test_port_mapping_gauge() {
        let gauge = PORT_MAPPINGS_ACTIVE.with_label_values(&["sctp-test"]);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }
}
