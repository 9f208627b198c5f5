//! The report emitted on stdout.
//!
//! Exactly one JSON line leaves a runcage invocation, whatever happened. The
//! jailer writes the primary report after the target exits; the supervisor
//! either passes it through verbatim or re-emits it with the cgroup violation
//! tags appended. Internal failures fold into the same shape with
//! `exit_code = -1` so downstream callers parse one format.

use serde::{Deserialize, Serialize};

/// Exit code reported when the sandbox itself failed, as opposed to the
/// target failing inside it.
pub const INTERNAL_ERROR: i32 = -1;

/// Resource and exit accounting for the target process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Terminating signal number, if the target was signalled.
    pub signal: Option<i32>,
    pub exit_code: i32,
    /// System CPU time in nanoseconds.
    pub sys_time: i64,
    /// User CPU time in nanoseconds.
    #[serde(rename = "time")]
    pub user_time: i64,
    /// Wall clock from spawn to reap in nanoseconds.
    pub wall_time: i64,
    /// Peak resident set size in kilobytes.
    pub memory: i64,
}

/// The one-line invocation report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Combined stdout and stderr of the target.
    pub output: String,
    /// Violation and termination tags, oldest first. Empty on a clean run.
    pub message: Vec<String>,
    pub metric: Metrics,
}

impl Report {
    /// Fold an internal failure into the uniform report shape.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Report {
            output: String::new(),
            message: vec![message.into()],
            metric: Metrics {
                exit_code: INTERNAL_ERROR,
                ..Metrics::default()
            },
        }
    }

    /// Append violation tags observed after the fact (cgroup events).
    pub fn append_messages<I>(&mut self, tags: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.message.extend(tags);
    }

    /// Serialize as the single stdout line, newline included.
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_field_names() {
        let report = Report {
            output: "hi\n".into(),
            message: vec![],
            metric: Metrics {
                signal: None,
                exit_code: 0,
                sys_time: 1_000,
                user_time: 2_000,
                wall_time: 3_000,
                memory: 640,
            },
        };

        let json = serde_json::to_value(&report).unwrap();
        let metric = &json["metric"];
        assert_eq!(metric["signal"], serde_json::Value::Null);
        assert_eq!(metric["exit_code"], 0);
        assert_eq!(metric["sys_time"], 1_000);
        assert_eq!(metric["time"], 2_000);
        assert_eq!(metric["wall_time"], 3_000);
        assert_eq!(metric["memory"], 640);
    }

    #[test]
    fn test_roundtrip() {
        let report = Report {
            output: "x".into(),
            message: vec!["time limit exceeded".into()],
            metric: Metrics {
                signal: Some(9),
                exit_code: -1,
                ..Metrics::default()
            },
        };

        let line = report.to_json_line().unwrap();
        assert!(line.ends_with('\n'));
        let back: Report = serde_json::from_str(&line).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_internal_error_shape() {
        let report = Report::internal_error("mount error: busy");
        assert_eq!(report.metric.exit_code, INTERNAL_ERROR);
        assert_eq!(report.message, vec!["mount error: busy".to_string()]);
        assert!(report.output.is_empty());
    }

    #[test]
    fn test_append_messages_preserves_order() {
        let mut report = Report::default();
        report.append_messages(["memory restriction violated".to_string()]);
        report.append_messages(["maximum pids restriction violated".to_string()]);
        assert_eq!(report.message.len(), 2);
        assert_eq!(report.message[0], "memory restriction violated");
    }
}
