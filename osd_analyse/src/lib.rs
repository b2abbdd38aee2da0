//! Core data-file loading and windowing library for OpenSeizureDetector logs.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDateTime;
use csv::{ReaderBuilder, StringRecord, Trim};
use ndarray::Array1;
use thiserror::Error;

pub mod window;

pub use window::{event_points, parse_window_bound, EventPoint, Severity, WindowedTable};

/// Spectral power below or at this level masks `roi_ratio2` to zero.
pub const POW_THRESHOLD: f64 = 100.0;
/// Reference line drawn against `roi_ratio2` for visual comparison.
pub const ROI_RATIO_THRESHOLD: f64 = 54.0;

/// Number of frequency-band channels (`1Hz`..`10Hz`).
pub const FREQ_BANDS: usize = 10;
/// Number of raw accelerometer-derived channels (`d001`..`d125`).
pub const ACC_CHANNELS: usize = 125;
/// Fixed physical layout: timestamp, 10 bands, specPow, roiPow, sampleFreq,
/// statusStr, HR, then the accelerometer block.
pub const COLUMN_COUNT: usize = 16 + ACC_CHANNELS;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("failed to read data file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed data file: {0}")]
    Csv(#[from] csv::Error),
    #[error("row {row}: expected {expected} columns, found {found}")]
    ColumnCount {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("row {row}: unparsable timestamp '{value}'")]
    Timestamp { row: usize, value: String },
    #[error("row {row}, column {column}: non-numeric value '{value}'")]
    Numeric {
        row: usize,
        column: usize,
        value: String,
    },
    #[error("data file contains no records")]
    Empty,
    #[error("invalid window bound '{0}', expected dd-mm-yyyy hh:mm")]
    WindowBound(String),
}

/// One parsed log row with its derived statistics.
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub datetime: NaiveDateTime,
    pub bands: [f64; FREQ_BANDS],
    pub spec_pow: f64,
    pub roi_pow: f64,
    pub sample_freq: f64,
    pub status_str: String,
    pub hr: f64,
    pub acc: Array1<f64>,
    pub acc_mean: f64,
    pub acc_sd: f64,
    pub roi_ratio: f64,
    pub roi_ratio2: f64,
    pub time_from_start_h: f64,
}

/// The full loaded table, ascending by timestamp by construction of the log.
#[derive(Clone, Debug, Default)]
pub struct LogTable {
    pub records: Vec<LogRecord>,
}

impl LogTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read a data file and produce the labelled table with derived columns.
pub fn load_datafile(path: &Path) -> Result<LogTable, LogError> {
    let file = File::open(path)?;
    from_reader(file)
}

/// Parse log records from any reader. The first row is consumed as a header;
/// the fixed positional layout overrides whatever it says.
pub fn from_reader<R: Read>(input: R) -> Result<LogTable, LogError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(input);

    let mut records = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row?;
        // Human row numbers: 1-based plus the header row.
        records.push(parse_row(&row, idx + 2)?);
    }
    if records.is_empty() {
        return Err(LogError::Empty);
    }

    // Re-centre the per-row means around the whole-table mean.
    let table_mean = records.iter().map(|r| r.acc_mean).sum::<f64>() / records.len() as f64;
    for record in &mut records {
        record.acc_mean -= table_mean;
    }

    let start = records[0].datetime;
    for record in &mut records {
        record.time_from_start_h =
            (record.datetime - start).num_milliseconds() as f64 / 3_600_000.0;
    }

    Ok(LogTable { records })
}

fn parse_row(row: &StringRecord, line: usize) -> Result<LogRecord, LogError> {
    if row.len() != COLUMN_COUNT {
        return Err(LogError::ColumnCount {
            row: line,
            expected: COLUMN_COUNT,
            found: row.len(),
        });
    }

    let raw_datetime = &row[0];
    let datetime = parse_log_timestamp(raw_datetime).ok_or_else(|| LogError::Timestamp {
        row: line,
        value: raw_datetime.to_string(),
    })?;

    let mut bands = [0.0; FREQ_BANDS];
    for (i, band) in bands.iter_mut().enumerate() {
        *band = numeric_field(row, line, 1 + i)?;
    }
    let spec_pow = numeric_field(row, line, 11)?;
    let roi_pow = numeric_field(row, line, 12)?;
    let sample_freq = numeric_field(row, line, 13)?;
    let status_str = row[14].to_string();
    let hr = numeric_field(row, line, 15)?;

    let acc = (16..COLUMN_COUNT)
        .map(|col| numeric_field(row, line, col))
        .collect::<Result<Vec<f64>, _>>()?;
    let acc = Array1::from_vec(acc);

    // Per-row statistics; the global re-centring of acc_mean happens once the
    // whole table is in memory.
    let acc_mean = acc.mean().unwrap_or(0.0);
    let acc_sd = acc.std(1.0);
    let roi_ratio = 10.0 * roi_pow / spec_pow;
    let roi_ratio2 = if spec_pow > POW_THRESHOLD {
        roi_ratio
    } else {
        0.0
    };

    Ok(LogRecord {
        datetime,
        bands,
        spec_pow,
        roi_pow,
        sample_freq,
        status_str,
        hr,
        acc,
        acc_mean,
        acc_sd,
        roi_ratio,
        roi_ratio2,
        time_from_start_h: 0.0,
    })
}

fn numeric_field(row: &StringRecord, line: usize, column: usize) -> Result<f64, LogError> {
    let value = &row[column];
    value.parse::<f64>().map_err(|_| LogError::Numeric {
        row: line,
        column: column + 1,
        value: value.to_string(),
    })
}

const LOG_TIMESTAMP_FORMATS: &[&str] = &[
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

pub(crate) fn parse_log_timestamp(value: &str) -> Option<NaiveDateTime> {
    LOG_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> String {
        let mut fields = vec![
            "dataTime".to_string(),
            "1Hz".into(),
            "2Hz".into(),
            "3Hz".into(),
            "4Hz".into(),
            "5Hz".into(),
            "6Hz".into(),
            "7Hz".into(),
            "8Hz".into(),
            "9Hz".into(),
            "10Hz".into(),
            "specPow".into(),
            "roiPow".into(),
            "sampleFreq".into(),
            "statusStr".into(),
            "HR".into(),
        ];
        for i in 1..=ACC_CHANNELS {
            fields.push(format!("d{:03}", i));
        }
        fields.join(",")
    }

    fn data_row(datetime: &str, spec_pow: f64, roi_pow: f64, status: &str, acc_base: f64) -> String {
        let mut fields = vec![datetime.to_string()];
        for i in 0..FREQ_BANDS {
            fields.push(format!("{}", i + 1));
        }
        fields.push(format!("{}", spec_pow));
        fields.push(format!("{}", roi_pow));
        fields.push("250".to_string());
        fields.push(status.to_string());
        fields.push("72".to_string());
        for i in 0..ACC_CHANNELS {
            fields.push(format!("{}", acc_base + i as f64));
        }
        fields.join(",")
    }

    fn sample_csv() -> String {
        [
            header(),
            data_row("01-06-2019 06:45:00", 500.0, 2000.0, "OK", 1000.0),
            data_row("01-06-2019 06:50:00", 80.0, 400.0, "WARNING", 1010.0),
            data_row("01-06-2019 07:45:00", 900.0, 5400.0, "ALARM", 990.0),
        ]
        .join("\n")
    }

    #[test]
    fn loads_well_formed_file() {
        let table = from_reader(sample_csv().as_bytes()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.records[0].status_str, "OK");
        assert_eq!(table.records[1].status_str, "WARNING");
        assert_eq!(table.records[2].status_str, "ALARM");
        assert_eq!(table.records[0].bands[0], 1.0);
        assert_eq!(table.records[0].bands[9], 10.0);
        assert_eq!(table.records[0].hr, 72.0);
        assert_eq!(table.records[0].acc.len(), ACC_CHANNELS);
    }

    #[test]
    fn acc_mean_recentres_to_zero() {
        let table = from_reader(sample_csv().as_bytes()).unwrap();
        let sum: f64 = table.records.iter().map(|r| r.acc_mean).sum();
        assert!(sum.abs() < 1e-9, "global acc_mean sum was {}", sum);
    }

    #[test]
    fn acc_sd_is_sample_standard_deviation() {
        // Channels are acc_base..acc_base+124; the sample std of 125
        // consecutive values is sqrt(125 * 126 / 12).
        let table = from_reader(sample_csv().as_bytes()).unwrap();
        let expected = (125.0_f64 * 126.0 / 12.0).sqrt();
        for record in &table.records {
            assert!((record.acc_sd - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn roi_ratio2_masked_at_power_threshold() {
        let table = from_reader(sample_csv().as_bytes()).unwrap();
        for record in &table.records {
            if record.spec_pow > POW_THRESHOLD {
                assert_eq!(record.roi_ratio2, record.roi_ratio);
            } else {
                assert_eq!(record.roi_ratio2, 0.0);
            }
        }
        // Row 2 sits below the threshold on purpose.
        assert_eq!(table.records[1].roi_ratio2, 0.0);
        assert!(table.records[1].roi_ratio > 0.0);
    }

    #[test]
    fn roi_ratio_is_ten_times_power_fraction() {
        let table = from_reader(sample_csv().as_bytes()).unwrap();
        let first = &table.records[0];
        assert!((first.roi_ratio - 10.0 * 2000.0 / 500.0).abs() < 1e-12);
    }

    #[test]
    fn time_from_start_in_hours() {
        let table = from_reader(sample_csv().as_bytes()).unwrap();
        assert_eq!(table.records[0].time_from_start_h, 0.0);
        assert!((table.records[1].time_from_start_h - 5.0 / 60.0).abs() < 1e-9);
        assert!((table.records[2].time_from_start_h - 1.0).abs() < 1e-9);
    }

    #[test]
    fn leading_whitespace_tolerated() {
        let csv = format!(
            "{}\n{}",
            header(),
            data_row("01-06-2019 06:45:00", 500.0, 2000.0, "OK", 1000.0).replace(',', ", ")
        );
        let table = from_reader(csv.as_bytes()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.records[0].spec_pow, 500.0);
    }

    #[test]
    fn wrong_column_count_fails() {
        let csv = format!("{}\n01-06-2019 06:45:00,1.0,2.0", header());
        match from_reader(csv.as_bytes()) {
            Err(LogError::ColumnCount { row, found, .. }) => {
                assert_eq!(row, 2);
                assert_eq!(found, 3);
            }
            other => panic!("expected ColumnCount error, got {:?}", other.map(|t| t.len())),
        }
    }

    #[test]
    fn unparsable_timestamp_fails() {
        let csv = format!(
            "{}\n{}",
            header(),
            data_row("yesterday teatime", 500.0, 2000.0, "OK", 1000.0)
        );
        assert!(matches!(
            from_reader(csv.as_bytes()),
            Err(LogError::Timestamp { row: 2, .. })
        ));
    }

    #[test]
    fn non_numeric_field_fails() {
        let row = data_row("01-06-2019 06:45:00", 500.0, 2000.0, "OK", 1000.0).replace("250", "fast");
        let csv = format!("{}\n{}", header(), row);
        assert!(matches!(
            from_reader(csv.as_bytes()),
            Err(LogError::Numeric { row: 2, .. })
        ));
    }

    #[test]
    fn empty_file_fails() {
        assert!(matches!(
            from_reader(header().as_bytes()),
            Err(LogError::Empty)
        ));
    }

    #[test]
    fn timestamp_formats_accepted() {
        for value in [
            "01-06-2019 06:45:00",
            "01-06-2019 06:45",
            "2019-06-01 06:45:00",
            "2019-06-01 06:45",
        ] {
            assert!(parse_log_timestamp(value).is_some(), "rejected {}", value);
        }
        assert!(parse_log_timestamp("06:45 01/06/2019").is_none());
    }

    #[test]
    fn loader_is_deterministic() {
        let a = from_reader(sample_csv().as_bytes()).unwrap();
        let b = from_reader(sample_csv().as_bytes()).unwrap();
        for (ra, rb) in a.records.iter().zip(b.records.iter()) {
            assert_eq!(ra.acc_mean, rb.acc_mean);
            assert_eq!(ra.acc_sd, rb.acc_sd);
            assert_eq!(ra.roi_ratio, rb.roi_ratio);
            assert_eq!(ra.roi_ratio2, rb.roi_ratio2);
            assert_eq!(ra.time_from_start_h, rb.time_from_start_h);
        }
    }
}
