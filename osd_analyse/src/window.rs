//! Time-window extraction and alarm/warning event filtering.

use chrono::NaiveDateTime;

use crate::{LogError, LogRecord, LogTable};

/// Pre-classified event severities carried in the status field of each row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Alarm,
    Warning,
}

impl Severity {
    /// Status string matched exactly, no fuzzy matching.
    pub fn label(self) -> &'static str {
        match self {
            Severity::Alarm => "ALARM",
            Severity::Warning => "WARNING",
        }
    }
}

/// One alarm/warning marker: the row's timestamp with its `roi_ratio` value,
/// which is what the scatter markers plot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EventPoint {
    pub datetime: NaiveDateTime,
    pub roi_ratio: f64,
}

/// The operator-selected sub-range, with `acc_mean` re-centred locally and
/// elapsed minutes alongside each record.
#[derive(Clone, Debug, Default)]
pub struct WindowedTable {
    pub records: Vec<LogRecord>,
    pub mins: Vec<f64>,
}

impl LogTable {
    /// Extract the subset with `start < datetime <= end` and re-normalise
    /// relative statistics within that window. Bounds that exclude every row
    /// yield an empty table rather than an error.
    pub fn time_slice(&self, start: NaiveDateTime, end: NaiveDateTime) -> WindowedTable {
        let in_window = |r: &LogRecord| r.datetime > start && r.datetime <= end;

        let mut records: Vec<LogRecord> = self
            .records
            .iter()
            .filter(|r| in_window(r))
            .cloned()
            .collect();
        if records.is_empty() {
            return WindowedTable::default();
        }

        // Minutes run from the window's first row but are taken off the
        // parent table's datetime column (longstanding quirk, kept as-is).
        let window_start = records[0].datetime;
        let mins: Vec<f64> = self
            .records
            .iter()
            .filter(|r| in_window(r))
            .map(|r| (r.datetime - window_start).num_milliseconds() as f64 / 60_000.0)
            .collect();

        // Second normalisation pass, local to the window.
        let window_mean = records.iter().map(|r| r.acc_mean).sum::<f64>() / records.len() as f64;
        for record in &mut records {
            record.acc_mean -= window_mean;
        }

        WindowedTable { records, mins }
    }
}

impl WindowedTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn event_points(&self, severity: Severity) -> Vec<EventPoint> {
        event_points(&self.records, severity)
    }
}

/// Rows whose status matches the given severity. An empty result is an
/// expected outcome, not an error.
pub fn event_points(records: &[LogRecord], severity: Severity) -> Vec<EventPoint> {
    records
        .iter()
        .filter(|r| r.status_str == severity.label())
        .map(|r| EventPoint {
            datetime: r.datetime,
            roi_ratio: r.roi_ratio,
        })
        .collect()
}

/// Parse an operator-supplied window bound (dd-mm-yyyy hh:mm, seconds and
/// ISO ordering also accepted).
pub fn parse_window_bound(value: &str) -> Result<NaiveDateTime, LogError> {
    crate::parse_log_timestamp(value).ok_or_else(|| LogError::WindowBound(value.to_string()))
}
