//! Log artifact providers for the utilization history pipeline.
//!
//! [`SysstatSource`] serves the fixed-role format: the daily `sa<DD>` file
//! rendered to text rows through `sar`. [`PerfLogSource`] serves the
//! header-driven format: performance counter CSV exports read directly,
//! with binary `.blg` logs converted through `relog` when no CSV exists.
//! Both keep every subprocess behind a deadline and surface failures as
//! [`HistoryError`] values for the core to degrade on.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use hostinv_core::history::{HistoryError, HistoryWindow, LogLayout, LogSource};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const SAR_TIMEOUT: Duration = Duration::from_secs(30);
const RELOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Daily sysstat accounting files, one per day of month.
pub struct SysstatSource {
    data_dir: Option<PathBuf>,
    sar_program: PathBuf,
    sar_timeout: Duration,
}

impl SysstatSource {
    pub fn new() -> Self {
        SysstatSource {
            data_dir: None,
            sar_program: PathBuf::from("sar"),
            sar_timeout: SAR_TIMEOUT,
        }
    }

    /// Override the accounting directory instead of probing the host layout.
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        SysstatSource {
            data_dir: Some(dir.into()),
            ..Self::new()
        }
    }

    #[cfg(test)]
    fn with_helper(program: impl Into<PathBuf>, limit: Duration) -> Self {
        SysstatSource {
            sar_program: program.into(),
            sar_timeout: limit,
            ..Self::new()
        }
    }

    fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        // RPM layout if present, Debian layout otherwise
        let rpm = Path::new("/var/log/sa");
        if rpm.exists() {
            rpm.to_path_buf()
        } else {
            PathBuf::from("/var/log/sysstat")
        }
    }
}

impl Default for SysstatSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogSource for SysstatSource {
    fn layout(&self) -> LogLayout {
        LogLayout::FixedRole
    }

    async fn locate_artifacts(
        &self,
        window: &HistoryWindow,
        _retention_days: u32,
    ) -> Result<Vec<PathBuf>, HistoryError> {
        let path = self.data_dir().join(format!("sa{}", window.day_token()));
        if !path.exists() {
            return Err(HistoryError::NotFound(format!(
                "Sysstat file not found: {}",
                path.display()
            )));
        }
        Ok(vec![path])
    }

    async fn read_rows(&self, path: &Path) -> Result<Vec<Vec<String>>, HistoryError> {
        let run = Command::new(&self.sar_program)
            .arg("-u")
            .arg("-f")
            .arg(path)
            .kill_on_drop(true)
            .output();
        let output = match timeout(self.sar_timeout, run).await {
            Err(_) => {
                return Err(HistoryError::Helper("sar command timed out".to_string()));
            }
            Ok(Err(err)) if err.kind() == ErrorKind::NotFound => {
                return Err(HistoryError::Helper(
                    "sar command not found. Install sysstat package.".to_string(),
                ));
            }
            Ok(Err(err)) => return Err(HistoryError::Io(err)),
            Ok(Ok(output)) => output,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HistoryError::Helper(format!(
                "sar command failed: {}",
                stderr.trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(tokenize(&stdout))
    }
}

fn tokenize(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .map(|line| line.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .filter(|row| !row.is_empty())
        .collect()
}

/// Performance counter log directory: `.csv` exports read directly, `.blg`
/// binaries converted when no CSV is available.
pub struct PerfLogSource {
    log_dir: PathBuf,
    relog_program: PathBuf,
    relog_timeout: Duration,
}

impl PerfLogSource {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        PerfLogSource {
            log_dir: log_dir.into(),
            relog_program: PathBuf::from("relog"),
            relog_timeout: RELOG_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_converter(
        log_dir: impl Into<PathBuf>,
        program: impl Into<PathBuf>,
        limit: Duration,
    ) -> Self {
        PerfLogSource {
            relog_program: program.into(),
            relog_timeout: limit,
            ..Self::new(log_dir)
        }
    }

    async fn convert_blg(&self, path: &Path) -> Result<tempfile::NamedTempFile, HistoryError> {
        let tmp = tempfile::Builder::new()
            .prefix("hostinv-relog-")
            .suffix(".csv")
            .tempfile()?;
        let run = Command::new(&self.relog_program)
            .arg(path)
            .arg("-f")
            .arg("CSV")
            .arg("-o")
            .arg(tmp.path())
            .arg("-y")
            .kill_on_drop(true)
            .output();
        let output = match timeout(self.relog_timeout, run).await {
            Err(_) => {
                return Err(HistoryError::Helper(
                    "relog conversion timed out".to_string(),
                ));
            }
            Ok(Err(err)) if err.kind() == ErrorKind::NotFound => {
                return Err(HistoryError::Helper("relog command not found".to_string()));
            }
            Ok(Err(err)) => return Err(HistoryError::Io(err)),
            Ok(Ok(output)) => output,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HistoryError::Helper(format!(
                "relog conversion failed: {}",
                stderr.trim()
            )));
        }
        Ok(tmp)
    }
}

#[async_trait]
impl LogSource for PerfLogSource {
    fn layout(&self) -> LogLayout {
        LogLayout::HeaderDriven
    }

    async fn locate_artifacts(
        &self,
        _window: &HistoryWindow,
        retention_days: u32,
    ) -> Result<Vec<PathBuf>, HistoryError> {
        if !self.log_dir.is_dir() {
            return Err(HistoryError::NotFound(format!(
                "Performance Monitor log directory not found: {}",
                self.log_dir.display()
            )));
        }

        let now = SystemTime::now();
        let mut files = Vec::new();
        walk_files(&self.log_dir, &mut files)?;

        let mut csvs = Vec::new();
        let mut blgs = Vec::new();
        for path in files {
            let recent = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|mtime| within_retention(mtime, now, retention_days))
                .unwrap_or(false);
            if !recent {
                continue;
            }
            match path.extension().and_then(|e| e.to_str()) {
                Some("csv") => csvs.push(path),
                Some("blg") => blgs.push(path),
                _ => {}
            }
        }
        csvs.sort();
        blgs.sort();

        if !csvs.is_empty() {
            debug!(count = csvs.len(), "using CSV performance logs");
            return Ok(csvs);
        }
        if let Some(first) = blgs.into_iter().next() {
            // only the first binary log is worth a conversion pass
            debug!(path = %first.display(), "no CSV logs; converting binary log");
            return Ok(vec![first]);
        }
        Err(HistoryError::NotFound(format!(
            "No Performance Monitor logs (.csv or .blg) found in {}",
            self.log_dir.display()
        )))
    }

    async fn read_rows(&self, path: &Path) -> Result<Vec<Vec<String>>, HistoryError> {
        if path.extension().and_then(|e| e.to_str()) == Some("blg") {
            // the temp file is removed when this binding drops
            let tmp = self.convert_blg(path).await?;
            return read_csv(tmp.path());
        }
        read_csv(path)
    }
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn within_retention(mtime: SystemTime, now: SystemTime, retention_days: u32) -> bool {
    match now.duration_since(mtime) {
        Ok(age) => age <= Duration::from_secs(u64::from(retention_days) * 86_400),
        // future mtime counts as recent
        Err(_) => true,
    }
}

fn read_csv(path: &Path) -> Result<Vec<Vec<String>>, HistoryError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(csv_error)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

fn csv_error(err: csv::Error) -> HistoryError {
    match err.into_kind() {
        csv::ErrorKind::Io(io) => HistoryError::Io(io),
        kind => HistoryError::NoData(format!("CSV read failed: {kind:?}")),
    }
}
