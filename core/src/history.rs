//! Historical utilization log normalization.
//!
//! Two heterogeneous tabular formats normalize into one
//! [`UtilizationSeries`]: a fixed-role table (the sar report shape, column
//! roles known by position) and a header-driven table (the performance
//! counter CSV shape, column roles discovered per artifact from header
//! text). The [`LogSource`] seam hands raw rows to the parsers here;
//! locating files and running helper programs stays outside the core.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// One normalized utilization measurement. Fields are optional because the
/// source formats carry different metric sets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtilizationSample {
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_available_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_percent: Option<f64>,
}

/// Normalized series over one historical window: either available with
/// samples, or unavailable with an error, never both.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UtilizationSeries {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub average: BTreeMap<String, f64>,
    pub samples: Vec<UtilizationSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UtilizationSeries {
    /// A degraded series carrying only the failure reason.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        UtilizationSeries {
            available: false,
            error: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Failure modes of log artifact location, reading, and conversion. All of
/// them degrade the series; none of them propagate out of [`build_series`].
#[derive(Debug, Error)]
pub enum HistoryError {
    /// No artifact exists for the window.
    #[error("{0}")]
    NotFound(String),
    /// Artifacts existed but yielded no usable samples.
    #[error("{0}")]
    NoData(String),
    /// A helper program failed, timed out, or is not installed.
    #[error("{0}")]
    Helper(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Row interpretation of a log source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLayout {
    /// Column roles fixed by position (sar report).
    FixedRole,
    /// Column roles discovered from the header row per artifact.
    HeaderDriven,
}

/// The historical window a series is built over: one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    pub date: time::Date,
}

impl HistoryWindow {
    /// Default window: the previous calendar day.
    pub fn previous_day() -> Self {
        let today = time::OffsetDateTime::now_utc().date();
        HistoryWindow {
            date: today.previous_day().unwrap_or(today),
        }
    }

    pub fn for_date(date: time::Date) -> Self {
        HistoryWindow { date }
    }

    /// Two-digit day of month, as daily sysstat artifacts are named.
    pub fn day_token(&self) -> String {
        format!("{:02}", self.date.day())
    }

    pub fn date_string(&self) -> String {
        format!(
            "{:04}-{:02}-{:02}",
            self.date.year(),
            u8::from(self.date.month()),
            self.date.day()
        )
    }
}

/// Locates and reads historical log artifacts.
///
/// `read_rows` hands back raw rows: whitespace-split tokens per line for
/// [`LogLayout::FixedRole`] sources, CSV fields per record (header row
/// first) for [`LogLayout::HeaderDriven`] sources.
#[async_trait]
pub trait LogSource: Send + Sync {
    fn layout(&self) -> LogLayout;

    /// Artifacts covering the window, modified within the retention bound,
    /// in processing order.
    async fn locate_artifacts(
        &self,
        window: &HistoryWindow,
        retention_days: u32,
    ) -> Result<Vec<PathBuf>, HistoryError>;

    /// Raw rows of one artifact, in file order.
    async fn read_rows(&self, path: &Path) -> Result<Vec<Vec<String>>, HistoryError>;
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Format A: fixed-role rows (sar report)
// ---------------------------------------------------------------------------

const FIXED_ROLE_MIN_COLS: usize = 8;

/// Parse fixed-role rows into the six-field average vector and per-timestamp
/// samples. Summary and data rows are handled independently; rows that do
/// not fit are skipped.
pub fn parse_fixed_role(rows: &[Vec<String>]) -> (BTreeMap<String, f64>, Vec<UtilizationSample>) {
    let mut average = BTreeMap::new();
    let mut samples = Vec::new();

    for parts in rows {
        if parts.len() < FIXED_ROLE_MIN_COLS {
            continue;
        }
        if parts[0] == "Average:" {
            if let Some(avg) = fixed_role_average(parts) {
                average = avg;
            }
            continue;
        }
        if parts[0].starts_with("Linux") {
            continue;
        }
        // the time-of-day column is first or second, locale dependent
        let time_col = if parts[0].contains(':') {
            0
        } else if parts[1].contains(':') {
            1
        } else {
            continue;
        };
        if let Some(sample) = fixed_role_sample(parts, time_col) {
            samples.push(sample);
        }
    }

    (average, samples)
}

fn fixed_role_average(parts: &[String]) -> Option<BTreeMap<String, f64>> {
    let mut avg = BTreeMap::new();
    for (offset, key) in ["user", "nice", "system", "iowait", "steal", "idle"]
        .iter()
        .enumerate()
    {
        let value: f64 = parts.get(offset + 2)?.parse().ok()?;
        avg.insert(key.to_string(), value);
    }
    Some(avg)
}

fn fixed_role_sample(parts: &[String], time_col: usize) -> Option<UtilizationSample> {
    // all six metric columns must parse or the row is dropped
    let mut values = [0f64; 6];
    for (i, slot) in values.iter_mut().enumerate() {
        *slot = parts.get(time_col + 2 + i)?.parse().ok()?;
    }
    let idle = values[5];
    Some(UtilizationSample {
        timestamp: parts[time_col].clone(),
        cpu_percent: Some(round2(100.0 - idle)),
        memory_available_mb: None,
        disk_percent: None,
    })
}

// ---------------------------------------------------------------------------
// Format B: header-driven rows (performance counter CSV)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Timestamp,
    Cpu,
    Memory,
    Disk,
}

fn is_timestamp_header(h: &str) -> bool {
    h.contains("PDH-CSV") || h.contains("Time")
}

fn is_cpu_header(h: &str) -> bool {
    h.contains("Processor Time") && h.contains("_Total")
}

fn is_memory_header(h: &str) -> bool {
    h.contains("Available MBytes")
}

fn is_disk_header(h: &str) -> bool {
    h.contains("Disk Time") && h.contains("_Total")
}

/// Ordered column-discovery rules; for each role the first matching header
/// wins and later headers cannot displace it.
const HEADER_RULES: &[(Role, fn(&str) -> bool)] = &[
    (Role::Timestamp, is_timestamp_header),
    (Role::Cpu, is_cpu_header),
    (Role::Memory, is_memory_header),
    (Role::Disk, is_disk_header),
];

#[derive(Debug, Default, Clone, Copy)]
struct Columns {
    timestamp: Option<usize>,
    cpu: Option<usize>,
    memory: Option<usize>,
    disk: Option<usize>,
}

impl Columns {
    fn max_index(&self) -> Option<usize> {
        [self.timestamp, self.cpu, self.memory, self.disk]
            .iter()
            .flatten()
            .copied()
            .max()
    }
}

fn discover_columns(headers: &[String]) -> Columns {
    let mut cols = Columns::default();
    for (role, matches) in HEADER_RULES {
        let slot = match role {
            Role::Timestamp => &mut cols.timestamp,
            Role::Cpu => &mut cols.cpu,
            Role::Memory => &mut cols.memory,
            Role::Disk => &mut cols.disk,
        };
        if slot.is_none() {
            *slot = headers.iter().position(|h| matches(h));
        }
    }
    cols
}

fn cell(row: &[String], idx: Option<usize>) -> Option<&str> {
    idx.and_then(|i| row.get(i)).map(|s| s.trim_matches('"'))
}

/// Parse header-driven rows. Returns the retained samples plus every CPU
/// value seen; availability and the aggregate are decided over the latter.
pub fn parse_header_driven(rows: &[Vec<String>]) -> (Vec<UtilizationSample>, Vec<f64>) {
    let mut samples = Vec::new();
    let mut cpu_values = Vec::new();
    if rows.len() < 2 {
        return (samples, cpu_values);
    }
    let cols = discover_columns(&rows[0]);
    let Some(max_idx) = cols.max_index() else {
        return (samples, cpu_values);
    };

    for row in &rows[1..] {
        if row.len() <= max_idx {
            continue;
        }
        let timestamp = cell(row, cols.timestamp).unwrap_or_default().to_string();
        let cpu = cell(row, cols.cpu).and_then(|s| s.parse::<f64>().ok());
        let memory = cell(row, cols.memory).and_then(|s| s.parse::<f64>().ok());
        let disk = cell(row, cols.disk).and_then(|s| s.parse::<f64>().ok());

        if let Some(v) = cpu {
            cpu_values.push(v);
        }
        // a row without cpu or memory carries nothing worth keeping
        if cpu.is_some() || memory.is_some() {
            samples.push(UtilizationSample {
                timestamp,
                cpu_percent: cpu.map(round2),
                memory_available_mb: memory.map(round2),
                disk_percent: disk.map(round2),
            });
        }
    }

    (samples, cpu_values)
}

/// total/min/max over the CPU values actually observed.
pub fn cpu_aggregate(values: &[f64]) -> BTreeMap<String, f64> {
    let mut avg = BTreeMap::new();
    if values.is_empty() {
        return avg;
    }
    let sum: f64 = values.iter().sum();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    avg.insert("total".to_string(), round2(sum / values.len() as f64));
    avg.insert("min".to_string(), round2(min));
    avg.insert("max".to_string(), round2(max));
    avg
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Drive a [`LogSource`] over one window and normalize whatever it yields.
///
/// Never fails: every [`HistoryError`] becomes an unavailable series with
/// the reason in `error`.
pub async fn build_series(
    source: &dyn LogSource,
    window: &HistoryWindow,
    retention_days: u32,
) -> UtilizationSeries {
    match collect(source, window, retention_days).await {
        Ok(series) => series,
        Err(err) => UtilizationSeries::unavailable(err.to_string()),
    }
}

async fn collect(
    source: &dyn LogSource,
    window: &HistoryWindow,
    retention_days: u32,
) -> Result<UtilizationSeries, HistoryError> {
    let artifacts = source.locate_artifacts(window, retention_days).await?;
    if artifacts.is_empty() {
        return Err(HistoryError::NotFound(
            "no log artifacts located for window".to_string(),
        ));
    }

    match source.layout() {
        LogLayout::FixedRole => {
            // one daily artifact
            let rows = source.read_rows(&artifacts[0]).await?;
            let (average, samples) = parse_fixed_role(&rows);
            if samples.is_empty() {
                return Err(HistoryError::NoData(
                    "sar output contained no usable samples".to_string(),
                ));
            }
            Ok(UtilizationSeries {
                available: true,
                date: Some(window.date_string()),
                average,
                samples,
                error: None,
            })
        }
        LogLayout::HeaderDriven => {
            let mut samples = Vec::new();
            let mut cpu_values = Vec::new();
            let mut last_err: Option<HistoryError> = None;
            for path in &artifacts {
                match source.read_rows(path).await {
                    Ok(rows) => {
                        let (mut s, mut c) = parse_header_driven(&rows);
                        samples.append(&mut s);
                        cpu_values.append(&mut c);
                    }
                    // keep going; the last failure is reported if nothing parses
                    Err(err) => last_err = Some(err),
                }
            }
            if cpu_values.is_empty() {
                return Err(last_err.unwrap_or_else(|| {
                    HistoryError::NoData(
                        "CSV files found but no valid CPU data extracted".to_string(),
                    )
                }));
            }
            Ok(UtilizationSeries {
                available: true,
                date: Some(window.date_string()),
                average: cpu_aggregate(&cpu_values),
                samples,
                error: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sar_rows(text: &str) -> Vec<Vec<String>> {
        text.lines()
            .map(|l| l.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|v| !v.is_empty())
            .collect()
    }

    fn csv_rows(text: &str) -> Vec<Vec<String>> {
        text.lines()
            .map(|l| l.split(',').map(str::to_string).collect())
            .collect()
    }

    const SAR_OUTPUT: &str = "\
Linux 5.15.0 (db01) \t08/24/25 \t_x86_64_ \t(4 CPU)

12:00:01        CPU     %user     %nice   %system   %iowait    %steal     %idle
12:10:01        all      1.23      0.00      0.45      0.10      0.00     98.22
12:20:01        all      2.00      0.00      1.00      0.50      0.00     96.50
Average:        all      1.61      0.00      0.72      0.30      0.00     97.36
";

    #[test]
    fn fixed_role_parses_data_and_average() {
        let (average, samples) = parse_fixed_role(&sar_rows(SAR_OUTPUT));
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].timestamp, "12:10:01");
        assert_eq!(samples[0].cpu_percent, Some(1.78));
        assert_eq!(samples[1].cpu_percent, Some(3.5));
        assert_eq!(average["user"], 1.61);
        assert_eq!(average["idle"], 97.36);
        assert_eq!(average.len(), 6);
    }

    #[test]
    fn fixed_role_skips_short_and_header_rows() {
        let text = "\
12:10:01        all      1.23      0.00      0.45      0.10      0.00     98.22
12:20:01        all      bad       0.00      1.00      0.50      0.00     96.50
12:30:01        all      2.00
";
        let (average, samples) = parse_fixed_role(&sar_rows(text));
        assert!(average.is_empty());
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn fixed_role_detects_second_column_time() {
        let text = "x 12:10:01 all 1.00 0.00 0.50 0.00 0.00 98.50";
        let (_, samples) = parse_fixed_role(&sar_rows(text));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].timestamp, "12:10:01");
        assert_eq!(samples[0].cpu_percent, Some(1.5));
    }

    const PDH_CSV: &str = "\
\"(PDH-CSV 4.0) (UTC)(0)\",\"\\\\HOST\\Memory\\Available MBytes\",\"\\\\HOST\\Processor(_Total)\\% Processor Time\"
\"08/24/2025 00:05:00.000\",\"2048.5001\",\"12.3456\"
\"08/24/2025 00:10:00.000\",\"2010.25\",\"15.5\"
";

    #[test]
    fn header_driven_discovers_reordered_columns() {
        let (samples, cpu_values) = parse_header_driven(&csv_rows(PDH_CSV));
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].timestamp, "08/24/2025 00:05:00.000");
        assert_eq!(samples[0].cpu_percent, Some(12.35));
        assert_eq!(samples[0].memory_available_mb, Some(2048.5));
        assert_eq!(cpu_values, vec![12.3456, 15.5]);
    }

    #[test]
    fn header_rules_first_match_wins() {
        // the cpu header also contains "Time"; the timestamp stays at
        // column 0 and is not displaced by the later match
        let rows = csv_rows(PDH_CSV);
        let cols = discover_columns(&rows[0]);
        assert_eq!(cols.timestamp, Some(0));
        assert_eq!(cols.cpu, Some(2));
        assert_eq!(cols.memory, Some(1));
        assert_eq!(cols.disk, None);
    }

    #[test]
    fn header_driven_skips_malformed_rows() {
        let mut text = String::from(
            "\"(PDH-CSV 4.0)\",\"\\\\H\\Processor(_Total)\\% Processor Time\"\n",
        );
        for i in 0..9 {
            text.push_str(&format!("\"t{}\",\"{}.0\"\n", i, i));
        }
        text.push_str("\"short\"\n");
        let (samples, cpu_values) = parse_header_driven(&csv_rows(&text));
        assert_eq!(samples.len(), 9);
        assert_eq!(cpu_values.len(), 9);
    }

    #[test]
    fn cpu_aggregate_rounds() {
        let avg = cpu_aggregate(&[1.0, 2.0, 4.0]);
        assert_eq!(avg["total"], 2.33);
        assert_eq!(avg["min"], 1.0);
        assert_eq!(avg["max"], 4.0);
        assert!(cpu_aggregate(&[]).is_empty());
    }

    // -- driver ------------------------------------------------------------

    struct VecSource {
        layout: LogLayout,
        artifacts: Vec<PathBuf>,
        rows: Vec<Vec<Vec<String>>>,
        read_error: Option<String>,
    }

    #[async_trait]
    impl LogSource for VecSource {
        fn layout(&self) -> LogLayout {
            self.layout
        }
        async fn locate_artifacts(
            &self,
            _window: &HistoryWindow,
            _retention_days: u32,
        ) -> Result<Vec<PathBuf>, HistoryError> {
            if self.artifacts.is_empty() {
                return Err(HistoryError::NotFound(
                    "Sysstat file not found: /var/log/sa/sa24".to_string(),
                ));
            }
            Ok(self.artifacts.clone())
        }
        async fn read_rows(&self, path: &Path) -> Result<Vec<Vec<String>>, HistoryError> {
            if let Some(msg) = &self.read_error {
                return Err(HistoryError::Helper(msg.clone()));
            }
            let idx = self
                .artifacts
                .iter()
                .position(|p| p == path)
                .unwrap_or_default();
            Ok(self.rows[idx].clone())
        }
    }

    fn window() -> HistoryWindow {
        HistoryWindow::for_date(time::Date::from_calendar_date(2025, time::Month::August, 24).unwrap())
    }

    #[tokio::test]
    async fn series_from_fixed_role_source() {
        let source = VecSource {
            layout: LogLayout::FixedRole,
            artifacts: vec![PathBuf::from("/var/log/sa/sa24")],
            rows: vec![sar_rows(SAR_OUTPUT)],
            read_error: None,
        };
        let series = build_series(&source, &window(), 2).await;
        assert!(series.available);
        assert_eq!(series.date.as_deref(), Some("2025-08-24"));
        assert_eq!(series.samples.len(), 2);
        assert!(series.error.is_none());
    }

    #[tokio::test]
    async fn missing_artifact_degrades_with_reason() {
        let source = VecSource {
            layout: LogLayout::FixedRole,
            artifacts: Vec::new(),
            rows: Vec::new(),
            read_error: None,
        };
        let series = build_series(&source, &window(), 2).await;
        assert!(!series.available);
        assert_eq!(
            series.error.as_deref(),
            Some("Sysstat file not found: /var/log/sa/sa24")
        );
        assert!(series.samples.is_empty());
        assert!(series.date.is_none());
    }

    #[tokio::test]
    async fn helper_failure_surfaces_diagnostic() {
        let source = VecSource {
            layout: LogLayout::HeaderDriven,
            artifacts: vec![PathBuf::from("/perf/a.blg")],
            rows: Vec::new(),
            read_error: Some("relog conversion timed out".to_string()),
        };
        let series = build_series(&source, &window(), 2).await;
        assert!(!series.available);
        assert_eq!(series.error.as_deref(), Some("relog conversion timed out"));
    }

    #[tokio::test]
    async fn zero_rows_is_distinct_from_not_found() {
        let source = VecSource {
            layout: LogLayout::FixedRole,
            artifacts: vec![PathBuf::from("/var/log/sa/sa24")],
            rows: vec![sar_rows("Linux 5.15.0 (db01)")],
            read_error: None,
        };
        let series = build_series(&source, &window(), 2).await;
        assert!(!series.available);
        assert_eq!(
            series.error.as_deref(),
            Some("sar output contained no usable samples")
        );
    }

    #[tokio::test]
    async fn memory_only_rows_stay_unavailable() {
        let text = "\
\"(PDH-CSV 4.0)\",\"\\\\H\\Memory\\Available MBytes\"
\"t0\",\"2048.0\"
";
        let source = VecSource {
            layout: LogLayout::HeaderDriven,
            artifacts: vec![PathBuf::from("/perf/a.csv")],
            rows: vec![csv_rows(text)],
            read_error: None,
        };
        let series = build_series(&source, &window(), 2).await;
        assert!(!series.available);
        assert_eq!(
            series.error.as_deref(),
            Some("CSV files found but no valid CPU data extracted")
        );
    }

    #[tokio::test]
    async fn multiple_artifacts_concatenate_in_order() {
        let a = "\
\"(PDH-CSV 4.0)\",\"\\\\H\\Processor(_Total)\\% Processor Time\"
\"t0\",\"1.0\"
";
        let b = "\
\"(PDH-CSV 4.0)\",\"\\\\H\\Processor(_Total)\\% Processor Time\"
\"t1\",\"3.0\"
";
        let source = VecSource {
            layout: LogLayout::HeaderDriven,
            artifacts: vec![PathBuf::from("/perf/a.csv"), PathBuf::from("/perf/b.csv")],
            rows: vec![csv_rows(a), csv_rows(b)],
            read_error: None,
        };
        let series = build_series(&source, &window(), 2).await;
        assert!(series.available);
        assert_eq!(series.samples.len(), 2);
        assert_eq!(series.samples[0].timestamp, "t0");
        assert_eq!(series.samples[1].timestamp, "t1");
        assert_eq!(series.average["total"], 2.0);
        assert_eq!(series.average["min"], 1.0);
        assert_eq!(series.average["max"], 3.0);
    }
}
