//! systemd registration for periodic snapshot collection.
//!
//! Renders a oneshot service plus a repeating timer, writes them into a
//! unit directory, then reloads and enables through `systemctl`. Rendering
//! and file writing are separated from the systemctl steps so they stay
//! testable without a live service manager.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

pub const SERVICE_UNIT: &str = "hostinv.service";
pub const TIMER_UNIT: &str = "hostinv.timer";

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SchedulePlan {
    pub every_hours: u32,
    pub binary_path: PathBuf,
    pub output_dir: PathBuf,
    pub unit_dir: PathBuf,
}

impl SchedulePlan {
    pub fn new(every_hours: u32, binary_path: impl Into<PathBuf>) -> Self {
        SchedulePlan {
            every_hours: every_hours.clamp(1, 24),
            binary_path: binary_path.into(),
            output_dir: PathBuf::from("/var/log/hostinv"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }

    pub fn render_service(&self) -> String {
        format!(
            "[Unit]\n\
             Description=Host Inventory Snapshot Service\n\
             After=network-online.target sysstat.service\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             ExecStart={binary} snapshot --pretty --out-dir {out}\n\
             User=root\n\
             Group=root\n\
             TimeoutSec=600\n\
             \n\
             StandardOutput=journal\n\
             StandardError=journal\n\
             SyslogIdentifier=hostinv\n\
             \n\
             PrivateTmp=true\n\
             ProtectSystem=strict\n\
             ProtectHome=true\n\
             ReadWritePaths={out}\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            binary = self.binary_path.display(),
            out = self.output_dir.display(),
        )
    }

    pub fn render_timer(&self) -> String {
        format!(
            "[Unit]\n\
             Description=Run Host Inventory Snapshot Every {hours} Hours\n\
             Requires={service}\n\
             \n\
             [Timer]\n\
             OnCalendar=00/{hours}:00:00\n\
             Persistent=true\n\
             RandomizedDelaySec=300\n\
             OnBootSec=5min\n\
             \n\
             [Install]\n\
             WantedBy=timers.target\n",
            hours = self.every_hours,
            service = SERVICE_UNIT,
        )
    }
}

/// What the installation actually did. A failed step records `error` and
/// leaves the later step flags false.
#[derive(Debug, Default, Serialize)]
pub struct InstallOutcome {
    pub service_written: bool,
    pub timer_written: bool,
    pub reloaded: bool,
    pub enabled: bool,
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn install(plan: &SchedulePlan) -> InstallOutcome {
    let mut outcome = InstallOutcome::default();

    if let Err(err) = systemctl(&["--version"]).await {
        outcome.error = Some(format!("systemd not available on this system: {err}"));
        return outcome;
    }
    if !plan.unit_dir.is_dir() {
        outcome.error = Some(format!("{} does not exist", plan.unit_dir.display()));
        return outcome;
    }
    if let Err(err) = fs::create_dir_all(&plan.output_dir) {
        // the service itself will fail later, but unit installation can proceed
        warn!(dir = %plan.output_dir.display(), error = %err, "could not create output directory");
    }

    match write_unit(&plan.unit_dir.join(SERVICE_UNIT), &plan.render_service()) {
        Ok(written) => outcome.service_written = written,
        Err(err) => {
            outcome.error = Some(format!("writing {SERVICE_UNIT}: {err}"));
            return outcome;
        }
    }
    match write_unit(&plan.unit_dir.join(TIMER_UNIT), &plan.render_timer()) {
        Ok(written) => outcome.timer_written = written,
        Err(err) => {
            outcome.error = Some(format!("writing {TIMER_UNIT}: {err}"));
            return outcome;
        }
    }

    if let Err(err) = systemctl(&["daemon-reload"]).await {
        outcome.error = Some(err.to_string());
        return outcome;
    }
    outcome.reloaded = true;

    match systemctl(&["enable", TIMER_UNIT]).await {
        Ok(()) => outcome.enabled = true,
        Err(err) => {
            // enabling an already-enabled timer exits nonzero on some distros
            if systemctl(&["is-enabled", TIMER_UNIT]).await.is_ok() {
                outcome.enabled = true;
            } else {
                outcome.error = Some(err.to_string());
                return outcome;
            }
        }
    }

    match systemctl(&["start", TIMER_UNIT]).await {
        Ok(()) => outcome.started = true,
        Err(err) => {
            if systemctl(&["is-active", TIMER_UNIT]).await.is_ok() {
                outcome.started = true;
            } else {
                outcome.error = Some(err.to_string());
            }
        }
    }

    outcome
}

/// Write the unit only when its content changed. Returns whether a write
/// happened.
fn write_unit(path: &Path, content: &str) -> std::io::Result<bool> {
    if let Ok(existing) = fs::read_to_string(path) {
        if existing == content {
            return Ok(false);
        }
    }
    fs::write(path, content)?;
    Ok(true)
}

async fn systemctl(args: &[&str]) -> Result<()> {
    let run = Command::new("systemctl")
        .args(args)
        .kill_on_drop(true)
        .output();
    let output = timeout(SYSTEMCTL_TIMEOUT, run)
        .await
        .map_err(|_| anyhow!("systemctl {} timed out", args.join(" ")))?
        .map_err(|err| anyhow!("systemctl failed to start: {err}"))?;
    if !output.status.success() {
        return Err(anyhow!(
            "systemctl {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}
