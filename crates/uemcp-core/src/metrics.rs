use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

const DURATION_SAMPLE_WINDOW: usize = 200;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct ToolMetricState {
    total_requests: u64,
    ok_count: u64,
    partial_count: u64,
    error_count: u64,
    exception_count: u64,
    total_duration_ms: u64,
    max_duration_ms: u64,
    last_duration_ms: u64,
    retry_attempts: u64,
    duration_samples_ms: VecDeque<u64>,
}

impl ToolMetricState {
    fn record_duration(&mut self, duration_ms: u64, retry_attempts: u64) {
        self.total_requests += 1;
        self.total_duration_ms += duration_ms;
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);
        self.last_duration_ms = duration_ms;
        self.retry_attempts += retry_attempts;
        if self.duration_samples_ms.len() == DURATION_SAMPLE_WINDOW {
            self.duration_samples_ms.pop_front();
        }
        self.duration_samples_ms.push_back(duration_ms);
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    tool_metrics: BTreeMap<String, ToolMetricState>,
}

/// In-process counter/gauge/histogram sink.
///
/// Every component takes an `Option<Arc<RuntimeMetrics>>`; a `None` disables
/// bookkeeping entirely. The snapshot is a plain JSON object so one-shot
/// modes can print it and the log loop can emit it verbatim.
#[derive(Debug)]
pub struct RuntimeMetrics {
    started_ms: i64,
    state: Mutex<MetricsState>,
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self {
            started_ms: now_ms(),
            state: Mutex::new(MetricsState::default()),
        }
    }

    pub fn inc(&self, name: &str) {
        self.inc_by(name, 1);
    }

    pub fn inc_by(&self, name: &str, value: u64) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        *state.counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        state.gauges.insert(name.to_string(), value);
    }

    pub fn observe_tool_result(
        &self,
        tool: &str,
        status: &str,
        duration_ms: u64,
        retry_attempts: u64,
    ) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        let entry = state.tool_metrics.entry(tool.to_string()).or_default();
        entry.record_duration(duration_ms, retry_attempts);
        match status {
            "ok" => entry.ok_count += 1,
            "partial" => entry.partial_count += 1,
            _ => entry.error_count += 1,
        }
    }

    pub fn observe_tool_exception(
        &self,
        tool: &str,
        kind: &str,
        duration_ms: u64,
        retry_attempts: u64,
    ) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        let entry = state.tool_metrics.entry(tool.to_string()).or_default();
        entry.record_duration(duration_ms, retry_attempts);
        entry.exception_count += 1;
        *state
            .counters
            .entry(format!("tool_exception.{tool}.{kind}"))
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> Value {
        let state = self.state.lock().expect("metrics lock poisoned");
        let tools: Vec<Value> = state
            .tool_metrics
            .iter()
            .map(|(tool, entry)| {
                let avg_duration_ms = if entry.total_requests > 0 {
                    entry.total_duration_ms / entry.total_requests
                } else {
                    0
                };
                let failed_count = entry.error_count + entry.exception_count;
                let failure_rate = if entry.total_requests > 0 {
                    failed_count as f64 / entry.total_requests as f64
                } else {
                    0.0
                };
                json!({
                    "tool": tool,
                    "total_requests": entry.total_requests,
                    "ok_count": entry.ok_count,
                    "partial_count": entry.partial_count,
                    "error_count": entry.error_count,
                    "exception_count": entry.exception_count,
                    "retry_attempts": entry.retry_attempts,
                    "avg_duration_ms": avg_duration_ms,
                    "p95_duration_ms": p95_duration_ms(&entry.duration_samples_ms),
                    "max_duration_ms": entry.max_duration_ms,
                    "last_duration_ms": entry.last_duration_ms,
                    "failed_count": failed_count,
                    "failure_rate": (failure_rate * 10_000.0).round() / 10_000.0,
                    "sample_count": entry.duration_samples_ms.len(),
                })
            })
            .collect();

        json!({
            "started_at_ms": self.started_ms,
            "uptime_ms": (now_ms() - self.started_ms).max(0),
            "counters": state.counters,
            "gauges": state.gauges,
            "tool_metrics": tools,
        })
    }
}

fn p95_duration_ms(samples: &VecDeque<u64>) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let index = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_accumulate() {
        let metrics = RuntimeMetrics::new();
        metrics.inc("requests");
        metrics.inc_by("requests", 2);
        metrics.set_gauge("pending", 4.0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["counters"]["requests"], 3);
        assert_eq!(snapshot["gauges"]["pending"], 4.0);
    }

    #[test]
    fn tool_observations_aggregate_by_status() {
        let metrics = RuntimeMetrics::new();
        metrics.observe_tool_result("umg.widget.add", "ok", 10, 0);
        metrics.observe_tool_result("umg.widget.add", "partial", 20, 1);
        metrics.observe_tool_result("umg.widget.add", "error", 30, 0);
        metrics.observe_tool_exception("umg.widget.add", "Connection", 40, 1);

        let snapshot = metrics.snapshot();
        let tool = &snapshot["tool_metrics"][0];
        assert_eq!(tool["tool"], "umg.widget.add");
        assert_eq!(tool["total_requests"], 4);
        assert_eq!(tool["ok_count"], 1);
        assert_eq!(tool["partial_count"], 1);
        assert_eq!(tool["error_count"], 1);
        assert_eq!(tool["exception_count"], 1);
        assert_eq!(tool["failed_count"], 2);
        assert_eq!(tool["retry_attempts"], 2);
        assert_eq!(tool["avg_duration_ms"], 25);
        assert_eq!(tool["max_duration_ms"], 40);
        assert_eq!(tool["last_duration_ms"], 40);
        assert_eq!(tool["failure_rate"], 0.5);
        assert_eq!(
            snapshot["counters"]["tool_exception.umg.widget.add.Connection"],
            1
        );
    }

    #[test]
    fn p95_uses_the_sorted_sample_window() {
        let mut samples: VecDeque<u64> = VecDeque::new();
        for value in 1..=100 {
            samples.push_back(value);
        }
        assert_eq!(p95_duration_ms(&samples), 95);
        assert_eq!(p95_duration_ms(&VecDeque::new()), 0);
    }
}
