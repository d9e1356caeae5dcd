//! Prometheus metrics exporter.
//!
//! Renders the metrics cache in Prometheus text format. Rendering reads one
//! cache snapshot and never touches the scheduler, so it is cheap and two
//! renders with no scheduler activity in between are byte-identical.

use std::sync::Arc;

use super::cache::{CacheEntry, MetricsCache};
use super::collector::ExporterStats;

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Label value identifying this exporter on `libvirt_connection_status`.
const CONNECTION_EXPORTER_LABEL: &str = "virtfs";

/// One metric family: header plus samples.
struct Family<'a> {
    name: String,
    help: &'a str,
    kind: &'a str,
    samples: Vec<(Vec<(&'a str, String)>, String)>,
}

impl<'a> Family<'a> {
    fn new(name: String, help: &'a str, kind: &'a str) -> Self {
        Self {
            name,
            help,
            kind,
            samples: Vec::new(),
        }
    }

    fn push(&mut self, labels: Vec<(&'a str, String)>, value: impl ToString) {
        self.samples.push((labels, value.to_string()));
    }

    /// Families without samples are omitted.
    fn write(&self, output: &mut String) {
        if self.samples.is_empty() {
            return;
        }
        output.push_str(&format!("# HELP {} {}\n", self.name, self.help));
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.kind));
        for (labels, value) in &self.samples {
            if labels.is_empty() {
                output.push_str(&format!("{} {}\n", self.name, value));
                continue;
            }
            let labels_str = labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
                .collect::<Vec<_>>()
                .join(",");
            output.push_str(&format!("{}{{{}}} {}\n", self.name, labels_str, value));
        }
    }
}

/// Escape a label value per the text exposition format.
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn domain_labels(entry: &CacheEntry) -> Vec<(&'static str, String)> {
    let d = &entry.domain;
    vec![
        ("domain", d.name.clone()),
        ("uuid", d.domain_id.clone()),
        ("name", d.display_name.clone()),
        ("project", d.project.clone()),
    ]
}

/// Prometheus metrics exporter.
pub struct PrometheusExporter {
    cache: Arc<MetricsCache>,
    stats: Arc<ExporterStats>,
    namespace: String,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter.
    pub fn new(cache: Arc<MetricsCache>, stats: Arc<ExporterStats>) -> Self {
        Self::with_namespace(cache, stats, "virtfs")
    }

    /// Create a new Prometheus exporter with custom namespace.
    pub fn with_namespace(
        cache: Arc<MetricsCache>,
        stats: Arc<ExporterStats>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            stats,
            namespace: namespace.into(),
        }
    }

    fn metric(&self, name: &str) -> String {
        format!("{}_{}", self.namespace, name)
    }

    /// Render metrics in Prometheus text format.
    ///
    /// Domains without a successful inspection emit no usage series, only
    /// their failure count.
    pub fn render(&self) -> String {
        let snapshot = self.cache.snapshot();
        let stats = self.stats.snapshot();

        let mut fs_used = Family::new(
            self.metric("filesystem_used_bytes"),
            "Bytes used on a guest filesystem at the last successful inspection",
            "gauge",
        );
        let mut fs_size = Family::new(
            self.metric("filesystem_size_bytes"),
            "Size in bytes of a guest filesystem at the last successful inspection",
            "gauge",
        );
        let mut storage_used = Family::new(
            self.metric("storage_used_bytes"),
            "Bytes used across all filesystems of a domain",
            "gauge",
        );
        let mut storage_total = Family::new(
            self.metric("storage_total_bytes"),
            "Total bytes across all filesystems of a domain",
            "gauge",
        );
        let mut collected = Family::new(
            self.metric("inspection_timestamp_seconds"),
            "Unix time of the last successful inspection",
            "gauge",
        );
        let mut stale = Family::new(
            self.metric("inspection_stale"),
            "1 if the served measurement is overdue or the latest attempt failed",
            "gauge",
        );
        let mut failures = Family::new(
            self.metric("inspection_consecutive_failures"),
            "Consecutive failed inspections since the last success",
            "gauge",
        );

        for entry in &snapshot.entries {
            let labels = domain_labels(entry);
            failures.push(labels.clone(), entry.consecutive_failures);

            let Some(result) = &entry.last_result else {
                continue;
            };

            for mount in &result.mounts {
                let mut mount_labels = labels.clone();
                mount_labels.push(("mount_point", mount.mount_point.clone()));
                mount_labels.push(("device", mount.device.clone()));
                mount_labels.push(("fs_type", mount.fs_type.clone()));
                fs_used.push(mount_labels.clone(), mount.bytes_used);
                fs_size.push(mount_labels, mount.bytes_total);
            }
            storage_used.push(labels.clone(), result.bytes_used());
            storage_total.push(labels.clone(), result.bytes_total());
            collected.push(labels.clone(), result.collected_at.timestamp());
            stale.push(labels, u8::from(entry.stale));
        }

        let mut connection = Family::new(
            "libvirt_connection_status".to_string(),
            "Libvirt status none (-1), connected (0), or error (1)",
            "gauge",
        );
        connection.push(
            vec![("node_exporter", CONNECTION_EXPORTER_LABEL.to_string())],
            snapshot.connection.gauge_value(),
        );

        let mut ticks = Family::new(
            self.metric("exporter_ticks_total"),
            "Scheduler ticks since start",
            "counter",
        );
        ticks.push(Vec::new(), stats.ticks_total);

        let mut enum_errors = Family::new(
            self.metric("exporter_enumeration_errors_total"),
            "Failed domain enumerations",
            "counter",
        );
        enum_errors.push(Vec::new(), stats.enumeration_errors_total);

        let mut inspections = Family::new(
            self.metric("exporter_inspections_total"),
            "Finished inspections by outcome",
            "counter",
        );
        let mut outcomes: Vec<_> = stats.inspections_total.iter().collect();
        outcomes.sort();
        for (outcome, count) in outcomes {
            inspections.push(vec![("outcome", outcome.clone())], *count);
        }

        let mut duration = Family::new(
            self.metric("exporter_inspection_duration_seconds_total"),
            "Wall time spent in finished inspections",
            "counter",
        );
        duration.push(
            Vec::new(),
            stats.inspection_duration_total_ms as f64 / 1000.0,
        );

        let mut tracked = Family::new(
            self.metric("exporter_domains_tracked"),
            "Domains seen in the last successful enumeration",
            "gauge",
        );
        tracked.push(Vec::new(), stats.domains_tracked);

        let mut in_flight = Family::new(
            self.metric("exporter_inspections_in_flight"),
            "Inspections currently running",
            "gauge",
        );
        in_flight.push(Vec::new(), stats.inspections_in_flight);

        let mut output = String::new();
        for family in [
            &fs_used,
            &fs_size,
            &storage_used,
            &storage_total,
            &collected,
            &stale,
            &failures,
            &connection,
            &ticks,
            &enum_errors,
            &inspections,
            &duration,
            &tracked,
            &in_flight,
        ] {
            family.write(&mut output);
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainRef, FailureReason, InspectionResult, MountUsage};
    use crate::hypervisor::ConnectionStatus;
    use crate::scheduler::DomainState;

    fn mount(mp: &str, used: u64, total: u64) -> MountUsage {
        MountUsage {
            mount_point: mp.into(),
            device: "/dev/sda1".into(),
            fs_type: "ext4".into(),
            bytes_used: used,
            bytes_total: total,
        }
    }

    fn entry(id: &str, result: Option<InspectionResult>, failures: u32) -> CacheEntry {
        CacheEntry {
            domain: DomainRef::new(id, format!("instance-{id}")).with_labels("web", "team-a"),
            state: DomainState::Fresh,
            last_result: result.map(Arc::new),
            last_attempt_at: None,
            consecutive_failures: failures,
            last_error: (failures > 0).then_some(FailureReason::Timeout),
            in_flight: false,
            stale: failures > 0,
        }
    }

    fn exporter() -> (Arc<MetricsCache>, Arc<ExporterStats>, PrometheusExporter) {
        let cache = Arc::new(MetricsCache::new());
        let stats = Arc::new(ExporterStats::new());
        let exporter = PrometheusExporter::new(Arc::clone(&cache), Arc::clone(&stats));
        (cache, stats, exporter)
    }

    #[test]
    fn test_empty_cache_renders_only_scheduler_state() {
        let (_, _, exporter) = exporter();
        let output = exporter.render();
        assert!(!output.contains("virtfs_filesystem_used_bytes"));
        assert!(output.contains("libvirt_connection_status{node_exporter=\"virtfs\"} -1"));
        assert!(output.contains("virtfs_exporter_ticks_total 0"));
    }

    #[test]
    fn test_inspection_duration_rendered_in_seconds() {
        let (_, stats, exporter) = exporter();
        stats.record_inspection_started();
        stats.record_inspection_finished("success", 1_500);
        stats.record_inspection_started();
        stats.record_inspection_finished("timeout", 60_000);

        let output = exporter.render();
        assert!(output.contains(
            "# TYPE virtfs_exporter_inspection_duration_seconds_total counter\n"
        ));
        assert!(output.contains("virtfs_exporter_inspection_duration_seconds_total 61.5\n"));
    }

    #[test]
    fn test_mount_series_carry_domain_labels() {
        let (cache, _, exporter) = exporter();
        cache.publish(entry(
            "vm1",
            Some(InspectionResult::success("vm1", vec![mount("/", 500, 1000)])),
            0,
        ));
        cache.set_connection_status(ConnectionStatus::Connected);

        let output = exporter.render();
        assert!(output.contains(
            "virtfs_filesystem_used_bytes{domain=\"instance-vm1\",uuid=\"vm1\",name=\"web\",project=\"team-a\",mount_point=\"/\",device=\"/dev/sda1\",fs_type=\"ext4\"} 500"
        ));
        assert!(output.contains("virtfs_storage_total_bytes{domain=\"instance-vm1\",uuid=\"vm1\",name=\"web\",project=\"team-a\"} 1000"));
        assert!(output.contains("libvirt_connection_status{node_exporter=\"virtfs\"} 0"));
    }

    #[test]
    fn test_help_and_type_written_once_per_family() {
        let (cache, _, exporter) = exporter();
        for id in ["a", "b", "c"] {
            cache.publish(entry(
                id,
                Some(InspectionResult::success(id, vec![mount("/", 1, 2), mount("/var", 3, 4)])),
                0,
            ));
        }
        let output = exporter.render();
        assert_eq!(output.matches("# TYPE virtfs_filesystem_used_bytes gauge").count(), 1);
        assert_eq!(output.matches("virtfs_filesystem_used_bytes{").count(), 6);
    }

    #[test]
    fn test_never_inspected_domain_emits_only_failures() {
        let (cache, _, exporter) = exporter();
        cache.publish(entry("vm9", None, 2));
        let output = exporter.render();
        assert!(!output.contains("uuid=\"vm9\",name=\"web\",project=\"team-a\",mount_point"));
        assert!(!output.contains("virtfs_storage_used_bytes"));
        assert!(output.contains(
            "virtfs_inspection_consecutive_failures{domain=\"instance-vm9\",uuid=\"vm9\",name=\"web\",project=\"team-a\"} 2"
        ));
    }

    #[test]
    fn test_failing_domain_keeps_serving_last_success() {
        let (cache, _, exporter) = exporter();
        cache.publish(entry(
            "vm1",
            Some(InspectionResult::success("vm1", vec![mount("/", 7, 9)])),
            3,
        ));
        let output = exporter.render();
        assert!(output.contains("mount_point=\"/\",device=\"/dev/sda1\",fs_type=\"ext4\"} 7"));
        assert!(output.contains("virtfs_inspection_stale{domain=\"instance-vm1\",uuid=\"vm1\",name=\"web\",project=\"team-a\"} 1"));
    }

    #[test]
    fn test_render_is_idempotent() {
        let (cache, stats, exporter) = exporter();
        cache.publish(entry(
            "vm1",
            Some(InspectionResult::success("vm1", vec![mount("/", 5, 10)])),
            0,
        ));
        for outcome in ["timeout", "success", "busy", "unreadable"] {
            stats.record_inspection_finished(outcome, 1);
        }
        assert_eq!(exporter.render(), exporter.render());
    }

    #[test]
    fn test_label_values_are_escaped() {
        assert_eq!(escape_label_value("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }

    #[test]
    fn test_custom_namespace() {
        let cache = Arc::new(MetricsCache::new());
        cache.publish(entry("vm1", None, 0));
        let exporter =
            PrometheusExporter::with_namespace(cache, Arc::new(ExporterStats::new()), "hostfs");
        assert!(exporter.render().contains("hostfs_inspection_consecutive_failures{"));
    }
}
