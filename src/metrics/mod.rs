use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry,
};
use lazy_static::lazy_static;
use std::sync::Arc;

use crate::models::InjectionStatus;

pub struct MetricsRegistry {
    registry: Registry,

    // Gauge metrics
    pub tracked_processes: IntGaugeVec,
    pub evaluations_in_flight: IntGauge,

    // Counter metrics
    pub attach_attempts: IntCounter,
    pub attach_failures: IntCounter,
    pub detaches: IntCounter,
    pub refreshes: IntCounter,
    pub exits: IntCounter,
    pub dropped_events: IntCounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let tracked_processes = register_int_gauge_vec_with_registry!(
            Opts::new("rasp_tracked_processes", "Tracked java processes by injection status"),
            &["status"],
            registry
        ).unwrap();

        let evaluations_in_flight = register_int_gauge_with_registry!(
            Opts::new("rasp_evaluations_in_flight", "Discovered processes still being evaluated"),
            registry
        ).unwrap();

        let attach_attempts = register_int_counter_with_registry!(
            Opts::new("rasp_attach_attempts_total", "Dynamic attach attempts"),
            registry
        ).unwrap();

        let attach_failures = register_int_counter_with_registry!(
            Opts::new("rasp_attach_failures_total", "Attach or token verification failures"),
            registry
        ).unwrap();

        let detaches = register_int_counter_with_registry!(
            Opts::new("rasp_detaches_total", "Agents exited because injection is disabled"),
            registry
        ).unwrap();

        let refreshes = register_int_counter_with_registry!(
            Opts::new("rasp_parameter_refreshes_total", "Soft flush and parameter updates"),
            registry
        ).unwrap();

        let exits = register_int_counter_with_registry!(
            Opts::new("rasp_process_exits_total", "Tracked java processes that exited"),
            registry
        ).unwrap();

        let dropped_events = register_int_counter_vec_with_registry!(
            Opts::new("rasp_dropped_events_total", "Events dropped because a queue was full"),
            &["queue"],
            registry
        ).unwrap();

        Self {
            registry,
            tracked_processes,
            evaluations_in_flight,
            attach_attempts,
            attach_failures,
            detaches,
            refreshes,
            exits,
            dropped_events,
        }
    }

    /// 按注入状态重置进程数
    pub fn set_tracked<I>(&self, statuses: I)
    where
        I: IntoIterator<Item = InjectionStatus>,
    {
        let mut counts = [0i64; InjectionStatus::ALL.len()];
        for status in statuses {
            if let Some(i) = InjectionStatus::ALL.iter().position(|s| *s == status) {
                counts[i] += 1;
            }
        }
        for (status, count) in InjectionStatus::ALL.iter().zip(counts) {
            self.tracked_processes
                .with_label_values(&[status.as_str()])
                .set(count);
        }
    }

    pub fn render(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

lazy_static! {
    pub static ref METRICS: Arc<MetricsRegistry> = Arc::new(MetricsRegistry::new());
}
