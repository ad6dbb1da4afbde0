//! Run summary: error-key normalization, console rendering, JSON output.

use hdrhistogram::Histogram;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// Pattern for bucketing HTTP status failures by code. Fixed at `200` for
/// compatibility with existing tooling even though the expected status is
/// configurable.
const STATUS_ERROR_PATTERN: &str = r"Expected 200-response, but got (\d+)";

fn status_error_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(STATUS_ERROR_PATTERN).expect("status error pattern is valid"))
}

/// A normalized failure bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBucket {
    pub key: String,
    pub count: u64,
}

/// Results of a benchmark run, frozen once the run completes.
#[derive(Debug, Serialize)]
pub struct Summary {
    pub connections: u64,
    pub request_rate: f64,
    pub success_total: u64,
    pub error_total: u64,
    pub elapsed: Duration,
    /// Completed requests (success or error) per elapsed second.
    pub throughput: f64,
    pub avg_request_time_ms: f64,
    pub errors: Vec<ErrorBucket>,
    pub timely_ticks: u64,
    pub timely_ticks_ratio: f64,
    pub timely_sends: u64,
    pub timely_sends_ratio: f64,
    #[serde(skip)]
    pub histogram: Histogram<u64>,
    #[serde(skip)]
    pub output_json: bool,
}

impl Summary {
    pub fn request_total(&self) -> u64 {
        self.success_total + self.error_total
    }

    pub fn success_rate(&self) -> f64 {
        percentage(self.success_total, self.request_total())
    }
}

/// `part` as a percentage of `whole`, 0 when `whole` is 0.
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Collapse raw error strings into presentation buckets: status-code
/// failures bucket under the numeric code, everything else stays verbatim.
/// Buckets are ordered by descending count; ties keep first-seen order.
pub fn normalize_errors(raw: Vec<(String, u64)>) -> Vec<ErrorBucket> {
    let re = status_error_regex();

    let mut buckets: Vec<ErrorBucket> = Vec::new();
    for (text, count) in raw {
        let key = match re.captures(&text).and_then(|c| c.get(1)) {
            Some(code) => code.as_str().to_string(),
            None => text,
        };
        match buckets.iter_mut().find(|b| b.key == key) {
            Some(bucket) => bucket.count += count,
            None => buckets.push(ErrorBucket { key, count }),
        }
    }

    buckets.sort_by_key(|b| std::cmp::Reverse(b.count));
    buckets
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "\n{{SuccessRate: {:.2}%, Throughput: {:.2} req/s, AvgRequestTime: {:.2} ms, \
             Connections: {}, RequestRate: {:.0}, RequestTotal: {}, SuccessTotal: {}, \
             ErrorTotal: {}, TimeElapsed: {:?}}}",
            self.success_rate(),
            self.throughput,
            self.avg_request_time_ms,
            self.connections,
            self.request_rate,
            self.request_total(),
            self.success_total,
            self.error_total,
            self.elapsed,
        )?;

        if self.output_json {
            match serde_json::to_string(self) {
                Ok(json) => writeln!(f, "\nJson Output: {json}")?,
                Err(_) => writeln!(f, "\nError creating Json")?,
            }
        }

        writeln!(f)?;
        self.write_metrics_table(f)?;

        if !self.errors.is_empty() {
            writeln!(f)?;
            self.write_error_table(f)?;
        }

        Ok(())
    }
}

const METRIC_WIDTH: usize = 24;
const VALUE_WIDTH: usize = 12;

impl Summary {
    fn write_metrics_table(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        table_header(f, "metric")?;

        let success_rate = self.success_rate();
        table_row(f, "Total Requests", &self.request_total().to_string(), "")?;
        table_row(
            f,
            "Successful Requests",
            &self.success_total.to_string(),
            &format!("{success_rate:.2}"),
        )?;
        table_row(
            f,
            "Failed Requests",
            &self.error_total.to_string(),
            &format!("{:.2}", 100.0 - success_rate),
        )?;
        table_row(
            f,
            "Time Elapsed (sec)",
            &format!("{:.2}", self.elapsed.as_secs_f64()),
            "",
        )?;
        table_row(
            f,
            "Request Rate (req/sec)",
            &format!("{:.2}", self.request_rate),
            "",
        )?;
        table_row(
            f,
            "Throughput (req/sec)",
            &format!("{:.2}", self.throughput),
            "",
        )?;
        table_row(
            f,
            "AvgRequestTime (ms)",
            &format!("{:.2}", self.avg_request_time_ms),
            "",
        )?;
        table_row(
            f,
            "Timely Ticks",
            &self.timely_ticks.to_string(),
            &format!("{:.2}", self.timely_ticks_ratio),
        )?;
        table_row(
            f,
            "Timely Sends",
            &self.timely_sends.to_string(),
            &format!("{:.2}", self.timely_sends_ratio),
        )
    }

    fn write_error_table(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        table_header(f, "error")?;

        let request_total = self.request_total();
        for bucket in &self.errors {
            table_row(
                f,
                &bucket.key,
                &bucket.count.to_string(),
                &format!("{:.2}", percentage(bucket.count, request_total)),
            )?;
        }
        Ok(())
    }
}

fn table_header(f: &mut fmt::Formatter<'_>, label: &str) -> fmt::Result {
    writeln!(
        f,
        "{label:<METRIC_WIDTH$} │ {:>VALUE_WIDTH$} │ {:>VALUE_WIDTH$}",
        "absolute", "percentage %"
    )?;
    writeln!(
        f,
        "{empty:─<METRIC_WIDTH$}─┼─{empty:─<VALUE_WIDTH$}─┼─{empty:─<VALUE_WIDTH$}",
        empty = ""
    )
}

fn table_row(f: &mut fmt::Formatter<'_>, label: &str, absolute: &str, pct: &str) -> fmt::Result {
    writeln!(f, "{label:<METRIC_WIDTH$} │ {absolute:>VALUE_WIDTH$} │ {pct:>VALUE_WIDTH$}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::new_latency_histogram;

    fn sample_summary() -> Summary {
        let mut histogram = new_latency_histogram();
        histogram.record(1_500_000).unwrap();
        Summary {
            connections: 4,
            request_rate: 100.0,
            success_total: 198,
            error_total: 2,
            elapsed: Duration::from_secs(2),
            throughput: 100.0,
            avg_request_time_ms: 1.5,
            errors: vec![ErrorBucket {
                key: "503".to_string(),
                count: 2,
            }],
            timely_ticks: 200,
            timely_ticks_ratio: 100.0,
            timely_sends: 197,
            timely_sends_ratio: 98.5,
            histogram,
            output_json: false,
        }
    }

    #[test]
    fn test_normalize_status_errors() {
        let buckets = normalize_errors(vec![
            ("Expected 200-response, but got 503".to_string(), 7),
            ("connection refused".to_string(), 3),
        ]);
        assert_eq!(
            buckets,
            vec![
                ErrorBucket {
                    key: "503".to_string(),
                    count: 7
                },
                ErrorBucket {
                    key: "connection refused".to_string(),
                    count: 3
                },
            ]
        );
    }

    #[test]
    fn test_normalize_only_matches_200_pattern() {
        // The pattern is fixed at 200; other expectations stay verbatim.
        let buckets = normalize_errors(vec![(
            "Expected 204-response, but got 500".to_string(),
            1,
        )]);
        assert_eq!(buckets[0].key, "Expected 204-response, but got 500");
    }

    #[test]
    fn test_normalize_sorts_descending_with_stable_ties() {
        let buckets = normalize_errors(vec![
            ("first".to_string(), 2),
            ("second".to_string(), 5),
            ("third".to_string(), 2),
        ]);
        let keys: Vec<&str> = buckets.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["second", "first", "third"]);
    }

    #[test]
    fn test_normalize_merges_buckets_with_same_code() {
        let buckets = normalize_errors(vec![
            ("Expected 200-response, but got 503".to_string(), 2),
            ("http://a: Expected 200-response, but got 503".to_string(), 3),
        ]);
        assert_eq!(
            buckets,
            vec![ErrorBucket {
                key: "503".to_string(),
                count: 5
            }]
        );
    }

    #[test]
    fn test_percentage_guards_zero_denominator() {
        assert_eq!(percentage(5, 0), 0.0);
        assert_eq!(percentage(5, 10), 50.0);
    }

    #[test]
    fn test_display_contains_header_and_tables() {
        let rendered = sample_summary().to_string();
        assert!(rendered.contains("{SuccessRate: 99.00%"));
        assert!(rendered.contains("Throughput: 100.00 req/s"));
        assert!(rendered.contains("Total Requests"));
        assert!(rendered.contains("Timely Sends"));
        assert!(rendered.contains("503"));
        assert!(!rendered.contains("Json Output"));
    }

    #[test]
    fn test_display_json_toggle() {
        let mut summary = sample_summary();
        summary.output_json = true;
        let rendered = summary.to_string();
        assert!(rendered.contains("Json Output: {"));
        assert!(rendered.contains("\"success_total\":198"));
    }

    #[test]
    fn test_error_table_omitted_when_clean() {
        let mut summary = sample_summary();
        summary.errors.clear();
        let rendered = summary.to_string();
        assert!(!rendered.contains("error "));
    }
}
