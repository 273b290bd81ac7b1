//! Live status endpoint.
//!
//! Renders a plain-text snapshot of the process: general info,
//! resource gauges, per-pool database figures and per-transport
//! request figures, plus a raw dump of every metric when the query
//! asks for it. Column layout and header strings are stable; scrapers
//! key on them.

use crate::db::manager::db_manager;
use crate::http::{HttpResponse, StatusCode};
use crate::telemetry;
use crate::transport::{self, ServerTransport};
use crate::Result;
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::sync::LazyLock;
use std::time::Duration;

const SEPARATOR: &str = "=============================================\n";
const SUBSEPARATOR: &str = "---------------------------------------------\n";

/// Wall-clock moment the status module first woke up; the server
/// touches this at startup so it reflects process start.
static START_TIME: LazyLock<DateTime<Local>> = LazyLock::new(Local::now);

/// Force-initialize the start time; call early in `main`.
pub fn mark_started() {
    let _ = *START_TIME;
}

/// Names a host sampler feeds; when the first one exists the
/// RESOURCES section renders, otherwise it reports the sampler as not
/// running.
pub mod sys_metrics {
    pub const CPU_USAGE_PERCENT: &str = "sys/cpu_usage_percent";
    pub const MEMORY_USAGE: &str = "sys/memory_usage";
    pub const CPU_USER_TIME: &str = "sys/cpu_user_time";
    pub const CPU_SYSTEM_TIME: &str = "sys/cpu_system_time";
    pub const MEMORY_MAX_USAGE: &str = "sys/memory_max_usage";
    pub const PAGE_SOFT_FAULTS: &str = "sys/page_soft_faults";
    pub const PAGE_HARD_FAULTS: &str = "sys/page_hard_faults";
    pub const BLOCK_INPUT_OPS: &str = "sys/block_input_ops";
    pub const BLOCK_OUTPUT_OPS: &str = "sys/block_output_ops";
    pub const CTX_SWITCHES_VOLUNTARY: &str = "sys/ctx_switches_voluntary";
    pub const CTX_SWITCHES_INVOLUNTARY: &str = "sys/ctx_switches_involuntary";
}

/// Bind the status page to `uri` on `transport`.
pub fn bind(transport: &ServerTransport, uri: &str) -> Result<()> {
    transport.bind_handler(
        uri,
        transport::handler(|context| async move {
            let raw = context.request.uri.query().split('&').any(|p| p == "raw");
            Ok(HttpResponse::text(StatusCode::OK, render(raw)))
        }),
    )
}

/// Render the whole snapshot.
pub fn render(raw: bool) -> String {
    let mut out = String::with_capacity(4096);
    general_section(&mut out);
    resources_section(&mut out);
    database_section(&mut out);
    transport_section(&mut out);
    if raw {
        raw_metrics_section(&mut out);
    }
    out
}

fn general_section(out: &mut String) {
    let now = Local::now();
    let start = *START_TIME;
    let run = (now - start).num_seconds().max(0);

    out.push_str(SEPARATOR);
    out.push_str("GENERAL\n\n");
    let _ = writeln!(out, "Time now:                   {}", now.format("%Y-%m-%d %X %Z"));
    let _ = writeln!(out, "Run since:                  {}", start.format("%Y-%m-%d %X"));
    let _ = writeln!(
        out,
        "Running:                    {:9}d {:02}:{:02}:{:02}",
        run / 86_400,
        run / 3_600 % 24,
        run / 60 % 60,
        run % 60
    );
    let _ = writeln!(out, "PID:                           {:7}", std::process::id());
    out.push('\n');
}

fn resources_section(out: &mut String) {
    out.push_str(SEPARATOR);
    out.push_str("RESOURCES\n\n");

    let registered: Vec<String> = telemetry::metrics()
        .iter()
        .map(|m| m.name().to_string())
        .collect();
    if !registered.iter().any(|n| n == sys_metrics::CPU_USAGE_PERCENT) {
        out.push_str("SysInfo wasn't run...\n\n");
        return;
    }

    let window = Duration::from_secs(15);
    let rate = |name: &str| telemetry::metric_counted(name, 1).avg_per_sec(window);
    let avg = |name: &str| telemetry::metric_counted(name, 1).avg(window);
    let last = |name: &str| telemetry::metric_counted(name, 1).sum_count(1);

    let _ = writeln!(
        out,
        "CPU current usage:             {:7.3} %",
        rate(sys_metrics::CPU_USAGE_PERCENT)
    );
    let _ = writeln!(
        out,
        "Physical memory current usage: {:7.0} kB",
        avg(sys_metrics::MEMORY_USAGE)
    );
    out.push('\n');
    let _ = writeln!(
        out,
        "User CPU time used:            {:7.3} s",
        last(sys_metrics::CPU_USER_TIME)
    );
    let _ = writeln!(
        out,
        "System CPU time used:          {:7.3} s",
        last(sys_metrics::CPU_SYSTEM_TIME)
    );
    let _ = writeln!(
        out,
        "Maximum resident set size:     {:7.0} kB",
        last(sys_metrics::MEMORY_MAX_USAGE)
    );
    let _ = writeln!(
        out,
        "Soft/hard page faults:         {:7.0}/{:.0}",
        last(sys_metrics::PAGE_SOFT_FAULTS),
        last(sys_metrics::PAGE_HARD_FAULTS)
    );
    let _ = writeln!(
        out,
        "Block input/output operations: {:7.0}/{:.0}",
        last(sys_metrics::BLOCK_INPUT_OPS),
        last(sys_metrics::BLOCK_OUTPUT_OPS)
    );
    let _ = writeln!(
        out,
        "Vol./Invol. context switches:  {:7.0}/{:.0}",
        last(sys_metrics::CTX_SWITCHES_VOLUNTARY),
        last(sys_metrics::CTX_SWITCHES_INVOLUNTARY)
    );
    out.push('\n');
}

fn database_section(out: &mut String) {
    out.push_str(SEPARATOR);
    out.push_str("DATABASE\n\n");

    let window = Duration::from_secs(15);
    db_manager().for_each(|pool| {
        let query_count = pool.metric_avg_query_per_sec.sum(window);
        let exec_ms = if query_count > 0.0 {
            pool.metric_avg_execution_time.sum(window) / query_count * 1000.0
        } else {
            0.0
        };
        out.push_str(SUBSEPARATOR);
        let _ = writeln!(out, "[{}]", pool.name());
        let _ = writeln!(
            out,
            "All connections:               {:7.0}",
            pool.metric_sum_connections.sum_count(1)
        );
        let _ = writeln!(
            out,
            "Successful queries:            {:7.0}",
            pool.metric_success_query_count.sum_count(1)
        );
        let _ = writeln!(
            out,
            "Fail queries:                  {:7.0}",
            pool.metric_fail_query_count.sum_count(1)
        );
        let _ = writeln!(
            out,
            "Current avg execution speed:   {:7.3} qps",
            query_count / 15.0
        );
        let _ = writeln!(
            out,
            "Current avg execution time:    {:7.3} ms",
            exec_ms
        );
        out.push('\n');
    });
}

fn transport_section(out: &mut String) {
    out.push_str(SEPARATOR);
    out.push_str("TRANSPORT\n\n");

    let window = Duration::from_secs(15);
    transport::transports().for_each(|t| {
        let request_count = t.metric_avg_request_per_sec.sum(window);
        let exec_ms = if request_count > 0.0 {
            t.metric_avg_execution_time.sum(window) / request_count * 1000.0
        } else {
            0.0
        };
        out.push_str(SUBSEPARATOR);
        let _ = writeln!(out, "[{}]", t.name());
        let _ = writeln!(
            out,
            "All connections:               {:7.0}",
            t.metric_connect_count.sum_count(1)
        );
        let _ = writeln!(
            out,
            "All requests:                  {:7.0}",
            t.metric_request_count.sum_count(1)
        );
        let _ = writeln!(
            out,
            "Current avg request speed:     {:7.3} rps",
            request_count / 15.0
        );
        let _ = writeln!(
            out,
            "Current avg execution time:    {:7.3} ms",
            exec_ms
        );
        out.push('\n');
    });
}

fn raw_metrics_section(out: &mut String) {
    out.push_str(SEPARATOR);
    out.push_str("RAW METRICS\n\n");

    let window = Duration::from_secs(15);
    for metric in telemetry::metrics() {
        let _ = writeln!(
            out,
            "{:<55} {:12.0} {:12.3} {:12.3}",
            metric.name(),
            metric.sum_count(1),
            metric.sum(window),
            metric.avg_per_sec(window)
        );
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_general_section_shape() {
        let body = render(false);
        assert!(body.starts_with(SEPARATOR));
        assert!(body.contains("GENERAL\n"));
        assert!(body.contains("Time now:"));
        assert!(body.contains("Running:"));
        assert!(body.contains("PID:"));
        assert!(body.contains("RESOURCES\n"));
        assert!(body.contains("DATABASE\n"));
        assert!(body.contains("TRANSPORT\n"));
        assert!(!body.contains("RAW METRICS"));
    }

    #[test]
    fn test_raw_section_lists_metrics() {
        telemetry::metric_counted("status_test/some_counter", 1).add_value(1.0);
        let body = render(true);
        assert!(body.contains("RAW METRICS\n"));
        assert!(body.contains("status_test/some_counter"));
    }

    #[test]
    fn test_resources_render_when_sampler_feeds() {
        // Before the sampler feeds anything, the section reports that.
        assert!(render(false).contains("SysInfo wasn't run..."));

        telemetry::metric_counted(sys_metrics::CPU_USAGE_PERCENT, 1).add_value(1.0);
        let body = render(false);
        assert!(body.contains("CPU current usage:"));
        assert!(body.contains("Physical memory current usage:"));
    }
}
