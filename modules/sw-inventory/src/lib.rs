//! Software and platform inventory sections.
//!
//! Each collector returns a typed section carrying an `error` field instead
//! of failing: a missing tool or unreadable source degrades that section
//! only. Subprocess enumeration is deadline-bounded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use procfs::Current;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const ENUM_TIMEOUT: Duration = Duration::from_secs(30);
const FIREWALL_TIMEOUT: Duration = Duration::from_secs(10);
// per-object queries: one docker container, one systemd unit
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

const UNIT_DEPENDENCY_LIMIT: usize = 100;

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

async fn run_capture(program: &str, args: &[&str], limit: Duration) -> Result<String> {
    let run = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    let output = timeout(limit, run)
        .await
        .map_err(|_| anyhow!("{program} timed out"))?
        .map_err(|err| anyhow!("{program} failed to start: {err}"))?;
    if !output.status.success() {
        return Err(anyhow!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

// ---------------------------------------------------------------------------
// system
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
pub struct SystemSection {
    pub hostname: Option<String>,
    pub kernel: Option<String>,
    pub architecture: &'static str,
    pub os_release: BTreeMap<String, String>,
    pub uptime_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn collect_system() -> SystemSection {
    let mut section = SystemSection {
        architecture: std::env::consts::ARCH,
        ..Default::default()
    };
    section.hostname = read_trimmed("/proc/sys/kernel/hostname");
    section.kernel = read_trimmed("/proc/sys/kernel/osrelease");
    if let Ok(text) = fs::read_to_string("/etc/os-release") {
        section.os_release = parse_os_release(&text);
    }
    match procfs::Uptime::current() {
        Ok(up) => section.uptime_seconds = Some(up.uptime),
        Err(err) => section.error = Some(err.to_string()),
    }
    section
}

fn read_trimmed(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Key/value pairs of os-release text: keys lowercased, quotes stripped.
fn parse_os_release(text: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            fields.insert(
                key.trim().to_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    fields
}

// ---------------------------------------------------------------------------
// cpu
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
pub struct CpuSection {
    pub model_name: Option<String>,
    pub logical_cores: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_cores: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mhz: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn collect_cpu() -> CpuSection {
    match fs::read_to_string("/proc/cpuinfo") {
        Ok(text) => parse_cpuinfo(&text),
        Err(err) => CpuSection {
            error: Some(err.to_string()),
            ..Default::default()
        },
    }
}

/// One block per logical cpu; physical cores are the distinct
/// (physical id, core id) pairs. Virtualized guests often omit those
/// keys, leaving the physical count unknown.
fn parse_cpuinfo(text: &str) -> CpuSection {
    let mut section = CpuSection::default();
    let mut cores: HashSet<(String, String)> = HashSet::new();
    for block in text.split("\n\n") {
        let mut physical_id = None;
        let mut core_id = None;
        let mut is_processor = false;
        for line in block.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "processor" => is_processor = true,
                "model name" if section.model_name.is_none() => {
                    section.model_name = Some(value.to_string());
                }
                "cpu MHz" if section.mhz.is_none() => section.mhz = value.parse().ok(),
                "physical id" => physical_id = Some(value.to_string()),
                "core id" => core_id = Some(value.to_string()),
                _ => {}
            }
        }
        if is_processor {
            section.logical_cores += 1;
            if let (Some(physical), Some(core)) = (physical_id, core_id) {
                cores.insert((physical, core));
            }
        }
    }
    if !cores.is_empty() {
        section.physical_cores = Some(cores.len());
    }
    section
}

// ---------------------------------------------------------------------------
// memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
pub struct MemorySection {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
    pub swap_total_bytes: u64,
    pub swap_free_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn collect_memory() -> MemorySection {
    let mem = match procfs::Meminfo::current() {
        Ok(mem) => mem,
        Err(err) => {
            return MemorySection {
                error: Some(err.to_string()),
                ..Default::default()
            };
        }
    };
    let total = mem.mem_total;
    let available = mem.mem_available.unwrap_or(mem.mem_free);
    let used_percent = if total > 0 {
        round2(total.saturating_sub(available) as f64 * 100.0 / total as f64)
    } else {
        0.0
    };
    MemorySection {
        total_bytes: total,
        available_bytes: available,
        used_percent,
        swap_total_bytes: mem.swap_total,
        swap_free_bytes: mem.swap_free,
        error: None,
    }
}

// ---------------------------------------------------------------------------
// disks
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DiskMount {
    pub device: String,
    pub mountpoint: String,
    pub filesystem: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_percent: f64,
}

#[derive(Debug, Default, Serialize)]
pub struct DiskSection {
    pub mounts: Vec<DiskMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn collect_disks() -> DiskSection {
    let entries = match procfs::mounts() {
        Ok(entries) => entries,
        Err(err) => {
            return DiskSection {
                error: Some(err.to_string()),
                ..Default::default()
            };
        }
    };
    let mut section = DiskSection::default();
    for entry in entries {
        // pseudo-filesystems have no block device behind them
        if !entry.fs_spec.starts_with("/dev/") {
            continue;
        }
        let Some((total, free)) = statvfs_bytes(Path::new(&entry.fs_file)) else {
            continue;
        };
        let used = total.saturating_sub(free);
        let used_percent = if total > 0 {
            round2(used as f64 * 100.0 / total as f64)
        } else {
            0.0
        };
        section.mounts.push(DiskMount {
            device: entry.fs_spec,
            mountpoint: entry.fs_file,
            filesystem: entry.fs_vfstype,
            total_bytes: total,
            free_bytes: free,
            used_percent,
        });
    }
    section
}

fn statvfs_bytes(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let block = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * block;
    let free = stat.f_bavail as u64 * block;
    Some((total, free))
}

// ---------------------------------------------------------------------------
// interfaces
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct InterfaceSection {
    pub interfaces: Vec<InterfaceCounters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn collect_interfaces() -> InterfaceSection {
    match procfs::net::dev_status() {
        Ok(devices) => {
            let mut interfaces: Vec<InterfaceCounters> = devices
                .into_values()
                .map(|dev| InterfaceCounters {
                    name: dev.name,
                    rx_bytes: dev.recv_bytes,
                    rx_packets: dev.recv_packets,
                    rx_errors: dev.recv_errs,
                    rx_dropped: dev.recv_drop,
                    tx_bytes: dev.sent_bytes,
                    tx_packets: dev.sent_packets,
                    tx_errors: dev.sent_errs,
                    tx_dropped: dev.sent_drop,
                })
                .collect();
            interfaces.sort_by(|a, b| a.name.cmp(&b.name));
            InterfaceSection {
                interfaces,
                error: None,
            }
        }
        Err(err) => InterfaceSection {
            error: Some(err.to_string()),
            ..Default::default()
        },
    }
}

// ---------------------------------------------------------------------------
// packages
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Serialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    pub source: &'static str,
}

#[derive(Debug, Default, Serialize)]
pub struct PackageSection {
    pub packages: Vec<Package>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Explicitly installed packages: the apt manual set on Debian-family
/// hosts; elsewhere the rpm database, narrowed to the dnf/yum
/// user-installed set when package history is available.
pub async fn collect_packages() -> PackageSection {
    match run_capture("apt-mark", &["showmanual"], ENUM_TIMEOUT).await {
        Ok(manual_out) => {
            let manual: HashSet<&str> = manual_out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect();
            match run_capture("dpkg", &["-l"], ENUM_TIMEOUT).await {
                Ok(dpkg_out) => {
                    return PackageSection {
                        packages: parse_dpkg(&dpkg_out, &manual),
                        error: None,
                    };
                }
                Err(err) => debug!(error = %err, "dpkg listing failed"),
            }
        }
        Err(err) => debug!(error = %err, "apt-mark unavailable"),
    }

    match run_capture(
        "rpm",
        &["-qa", "--qf", "%{NAME} %{VERSION}-%{RELEASE} %{ARCH}\n"],
        ENUM_TIMEOUT,
    )
    .await
    {
        Ok(out) => {
            let user_installed = rpm_user_installed().await;
            return PackageSection {
                packages: parse_rpm(&out, user_installed.as_ref()),
                error: None,
            };
        }
        Err(err) => debug!(error = %err, "rpm unavailable"),
    }

    PackageSection {
        error: Some("no supported package manager found".to_string()),
        ..Default::default()
    }
}

/// `dpkg -l` rows in installed state, restricted to the manual set.
fn parse_dpkg(output: &str, manual: &HashSet<&str>) -> Vec<Package> {
    let mut packages = Vec::new();
    for line in output.lines() {
        if !line.starts_with("ii") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let name = parts[1];
        if !manual.contains(name) {
            continue;
        }
        packages.push(Package {
            name: name.to_string(),
            version: parts[2].to_string(),
            architecture: parts.get(3).map(|s| s.to_string()),
            source: "apt",
        });
    }
    packages
}

/// User-installed package names as the dnf/yum history records them.
/// First query yielding names wins; no usable history means `None` and
/// the caller keeps the full database.
async fn rpm_user_installed() -> Option<HashSet<String>> {
    for (program, args) in [
        ("dnf", ["history", "userinstalled"]),
        ("dnf", ["repoquery", "--userinstalled"]),
        ("yum", ["history", "userinstalled"]),
    ] {
        match run_capture(program, &args, ENUM_TIMEOUT).await {
            Ok(out) => {
                let names = parse_user_installed(&out);
                if !names.is_empty() {
                    return Some(names);
                }
            }
            Err(err) => debug!(program, error = %err, "userinstalled query failed"),
        }
    }
    None
}

fn parse_user_installed(output: &str) -> HashSet<String> {
    let mut names = HashSet::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with("Packages installed")
            || line.starts_with("Last argument")
        {
            continue;
        }
        if let Some(token) = line.split_whitespace().next() {
            names.insert(nevra_name(token).to_string());
        }
    }
    names
}

/// Package name of a NEVRA-style token: everything before the first
/// `-<digit>` boundary, or the whole token without a version suffix.
fn nevra_name(token: &str) -> &str {
    let bytes = token.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'-' && bytes.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
            return &token[..i];
        }
    }
    token
}

fn parse_rpm(output: &str, user_installed: Option<&HashSet<String>>) -> Vec<Package> {
    let mut packages = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let name = parts[0];
        let source = match user_installed {
            Some(set) => {
                if !set.contains(name) {
                    continue;
                }
                "dnf/yum"
            }
            None => "rpm",
        };
        packages.push(Package {
            name: name.to_string(),
            version: parts[1].to_string(),
            architecture: Some(parts[2].to_string()),
            source,
        });
    }
    packages
}

// ---------------------------------------------------------------------------
// users
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Serialize)]
pub struct UserAccount {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
    pub system: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct UserSection {
    pub users: Vec<UserAccount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn collect_users() -> UserSection {
    collect_users_from(Path::new("/etc/passwd"))
}

fn collect_users_from(path: &Path) -> UserSection {
    match fs::read_to_string(path) {
        Ok(text) => UserSection {
            users: parse_passwd_accounts(&text),
            error: None,
        },
        Err(err) => UserSection {
            error: Some(err.to_string()),
            ..Default::default()
        },
    }
}

fn parse_passwd_accounts(text: &str) -> Vec<UserAccount> {
    let mut users = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 {
            continue;
        }
        let (Ok(uid), Ok(gid)) = (fields[2].parse::<u32>(), fields[3].parse::<u32>()) else {
            continue;
        };
        users.push(UserAccount {
            name: fields[0].to_string(),
            uid,
            gid,
            home: fields[5].to_string(),
            shell: fields[6].to_string(),
            system: uid < 1000,
        });
    }
    users
}

// ---------------------------------------------------------------------------
// firewall
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Serialize)]
pub struct FirewallRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    pub target: Option<String>,
    pub protocol: Option<String>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub source: Option<String>,
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub raw: String,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct UfwRule {
    pub action: &'static str,
    pub raw: String,
}

#[derive(Debug, Default, Serialize)]
pub struct FirewallSection {
    pub iptables_input: Vec<FirewallRule>,
    pub iptables_output: Vec<FirewallRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ufw_status: Option<String>,
    pub ufw_rules: Vec<UfwRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// iptables INPUT/OUTPUT chains plus ufw status. Each backend degrades
/// independently; `error` is set only when every backend failed.
pub async fn collect_firewall() -> FirewallSection {
    collect_firewall_with("iptables", "ufw").await
}

async fn collect_firewall_with(iptables: &str, ufw: &str) -> FirewallSection {
    let mut section = FirewallSection::default();
    let mut failures = Vec::new();

    for (chain, slot) in [("INPUT", 0usize), ("OUTPUT", 1)] {
        match run_capture(
            iptables,
            &["-L", chain, "-n", "-v", "--line-numbers"],
            FIREWALL_TIMEOUT,
        )
        .await
        {
            Ok(out) => {
                let rules = parse_iptables(&out);
                if slot == 0 {
                    section.iptables_input = rules;
                } else {
                    section.iptables_output = rules;
                }
            }
            Err(err) => {
                debug!(chain, error = %err, "iptables listing failed");
                failures.push(err.to_string());
            }
        }
    }

    match run_capture(ufw, &["status", "verbose"], FIREWALL_TIMEOUT).await {
        Ok(out) => {
            section.ufw_status = out.lines().next().map(|l| l.trim().to_string());
            section.ufw_rules = parse_ufw(&out);
        }
        Err(err) => {
            debug!(error = %err, "ufw status failed");
            failures.push(err.to_string());
        }
    }

    if failures.len() == 3 {
        section.error = Some(failures.join("; "));
    }
    section
}

/// Rows of `iptables -L <chain> -n -v --line-numbers`: everything after the
/// `num` header line, columns num/pkts/bytes/target/prot/opt/in/out/src/dst.
fn parse_iptables(output: &str) -> Vec<FirewallRule> {
    let mut rules = Vec::new();
    let mut in_data = false;
    for line in output.lines() {
        if line.starts_with("num") {
            in_data = true;
            continue;
        }
        if !in_data || line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let field = |idx: usize| parts.get(idx).map(|s| s.to_string());
        rules.push(FirewallRule {
            number: parts[0].parse().ok(),
            target: field(3),
            protocol: field(4),
            in_interface: field(6),
            out_interface: field(7),
            source: field(8),
            destination: field(9),
            detail: (parts.len() > 10).then(|| parts[10..].join(" ")),
            raw: line.trim().to_string(),
        });
    }
    rules
}

fn parse_ufw(output: &str) -> Vec<UfwRule> {
    let mut rules = Vec::new();
    for line in output.lines() {
        if line.contains("Default:") {
            continue;
        }
        for action in ["ALLOW", "DENY", "REJECT", "LIMIT"] {
            if line.contains(action) {
                rules.push(UfwRule {
                    action,
                    raw: line.trim().to_string(),
                });
                break;
            }
        }
    }
    rules
}

// ---------------------------------------------------------------------------
// services
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Serialize)]
pub struct ServiceUnit {
    pub name: String,
    pub load: Option<String>,
    pub active: Option<String>,
    pub sub: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ServiceSection {
    pub services: Vec<ServiceUnit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn collect_services() -> ServiceSection {
    match run_capture(
        "systemctl",
        &["list-units", "--type=service", "--state=running", "--no-pager"],
        ENUM_TIMEOUT,
    )
    .await
    {
        Ok(out) => ServiceSection {
            services: parse_service_units(&out),
            error: None,
        },
        Err(err) => ServiceSection {
            error: Some(err.to_string()),
            ..Default::default()
        },
    }
}

fn parse_service_units(output: &str) -> Vec<ServiceUnit> {
    let mut services = Vec::new();
    for line in output.lines().skip(1) {
        if !line.contains(".service") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(name) = parts.first() else { continue };
        services.push(ServiceUnit {
            name: name.to_string(),
            load: parts.get(1).map(|s| s.to_string()),
            active: parts.get(2).map(|s| s.to_string()),
            sub: parts.get(3).map(|s| s.to_string()),
        });
    }
    services
}

// ---------------------------------------------------------------------------
// service dependencies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct ServiceDependencies {
    pub unit: String,
    pub active_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment_path: Option<String>,
    pub requires: Vec<String>,
    pub wants: Vec<String>,
    pub required_by: Vec<String>,
    pub wanted_by: Vec<String>,
    pub after: Vec<String>,
    pub before: Vec<String>,
    pub conflicts: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ServiceDependencySection {
    pub services: Vec<ServiceDependencies>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

const UNIT_SHOW_PROPERTIES: &str = "--property=Requires,Wants,RequiredBy,WantedBy,\
After,Before,Conflicts,ActiveState,Description,FragmentPath";

/// Dependency sets of installed service units, one `systemctl show`
/// query per unit, capped to keep the walk bounded on unit-heavy hosts.
pub async fn collect_service_dependencies() -> ServiceDependencySection {
    let listing = match run_capture(
        "systemctl",
        &["list-unit-files", "--type=service", "--no-pager"],
        ENUM_TIMEOUT,
    )
    .await
    {
        Ok(out) => out,
        Err(err) => {
            return ServiceDependencySection {
                error: Some(err.to_string()),
                ..Default::default()
            };
        }
    };

    let mut section = ServiceDependencySection::default();
    for unit in unit_file_names(&listing)
        .into_iter()
        .take(UNIT_DEPENDENCY_LIMIT)
    {
        match run_capture(
            "systemctl",
            &["show", &unit, "--no-pager", UNIT_SHOW_PROPERTIES],
            QUERY_TIMEOUT,
        )
        .await
        {
            Ok(out) => section.services.push(parse_unit_dependencies(&unit, &out)),
            // a unit removed between the listing and the query is skipped
            Err(err) => debug!(unit = %unit, error = %err, "systemctl show failed"),
        }
    }
    section
}

fn unit_file_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.contains(".service"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn parse_unit_dependencies(unit: &str, output: &str) -> ServiceDependencies {
    let mut deps = ServiceDependencies {
        unit: unit.to_string(),
        ..Default::default()
    };
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key {
            "Requires" => deps.requires = split_units(value),
            "Wants" => deps.wants = split_units(value),
            "RequiredBy" => deps.required_by = split_units(value),
            "WantedBy" => deps.wanted_by = split_units(value),
            "After" => deps.after = split_units(value),
            "Before" => deps.before = split_units(value),
            "Conflicts" => deps.conflicts = split_units(value),
            "ActiveState" => deps.active_state = non_empty(value),
            "Description" => deps.description = non_empty(value),
            "FragmentPath" => deps.fragment_path = non_empty(value),
            _ => {}
        }
    }
    deps
}

fn split_units(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

// ---------------------------------------------------------------------------
// docker
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerContainer {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "Names", default)]
    pub names: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Ports", default)]
    pub ports: String,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerNetwork {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Driver", default)]
    pub driver: String,
    #[serde(rename = "Scope", default)]
    pub scope: String,
}

#[derive(Debug, Default, Serialize)]
pub struct DockerSection {
    pub installed: bool,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub containers: Vec<DockerContainer>,
    pub networks: Vec<DockerNetwork>,
    pub container_ports: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Docker engine state, running containers and networks, per-container
/// published ports. A host without the engine reports `installed=false`
/// with no error; an engine that cannot be queried sets `error`.
pub async fn collect_docker() -> DockerSection {
    let mut section = DockerSection::default();

    match run_capture("docker", &["--version"], QUERY_TIMEOUT).await {
        Ok(out) => {
            section.installed = true;
            section.version = Some(out.trim().to_string());
        }
        Err(err) => {
            debug!(error = %err, "docker not present");
            return section;
        }
    }

    match run_capture("docker", &["ps", "--format", "{{json .}}"], ENUM_TIMEOUT).await {
        Ok(out) => {
            section.running = true;
            section.containers = parse_json_lines(&out);
        }
        Err(err) => {
            debug!(error = %err, "docker daemon unreachable");
            section.error = Some(err.to_string());
            return section;
        }
    }

    match run_capture(
        "docker",
        &["network", "ls", "--format", "{{json .}}"],
        ENUM_TIMEOUT,
    )
    .await
    {
        Ok(out) => section.networks = parse_json_lines(&out),
        Err(err) => debug!(error = %err, "docker network listing failed"),
    }

    for container in &section.containers {
        if container.id.is_empty() {
            continue;
        }
        if let Ok(out) = run_capture("docker", &["port", &container.id], QUERY_TIMEOUT).await {
            let ports = out.trim();
            if !ports.is_empty() {
                section
                    .container_ports
                    .insert(container.names.clone(), ports.to_string());
            }
        }
    }
    section
}

/// One JSON document per line, as `--format {{json .}}` emits them.
/// Unparseable lines are dropped.
fn parse_json_lines<T: serde::de::DeserializeOwned>(output: &str) -> Vec<T> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// processes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TopProcess {
    pub pid: i32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub rss_kb: u64,
    pub memory_percent: f64,
}

#[derive(Debug, Default, Serialize)]
pub struct ProcessSection {
    pub processes: Vec<TopProcess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Visible processes ranked by resident set size, largest first.
pub fn collect_processes(limit: usize) -> ProcessSection {
    let all = match procfs::process::all_processes() {
        Ok(all) => all,
        Err(err) => {
            return ProcessSection {
                error: Some(err.to_string()),
                ..Default::default()
            };
        }
    };
    let users: HashMap<u32, String> = collect_users()
        .users
        .into_iter()
        .map(|account| (account.uid, account.name))
        .collect();
    let mem_total = procfs::Meminfo::current().map(|m| m.mem_total).unwrap_or(0);

    let mut processes = Vec::new();
    for proc in all.flatten() {
        let name = match proc.stat() {
            Ok(stat) => stat.comm,
            // exited between listing and stat read
            Err(_) => continue,
        };
        let rss_kb = proc.status().ok().and_then(|s| s.vmrss).unwrap_or(0);
        let memory_percent = if mem_total > 0 {
            round2(rss_kb as f64 * 1024.0 * 100.0 / mem_total as f64)
        } else {
            0.0
        };
        processes.push(TopProcess {
            pid: proc.pid(),
            name,
            username: proc.uid().ok().and_then(|uid| users.get(&uid).cloned()),
            rss_kb,
            memory_percent,
        });
    }
    ProcessSection {
        processes: top_by_rss(processes, limit),
        error: None,
    }
}

fn top_by_rss(mut processes: Vec<TopProcess>, limit: usize) -> Vec<TopProcess> {
    processes.sort_by(|a, b| b.rss_kb.cmp(&a.rss_kb).then_with(|| a.pid.cmp(&b.pid)));
    processes.truncate(limit);
    processes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_release_lowercases_and_strips_quotes() {
        let text = "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\n# comment\n";
        let fields = parse_os_release(text);
        assert_eq!(fields.get("name").map(String::as_str), Some("Ubuntu"));
        assert_eq!(fields.get("version_id").map(String::as_str), Some("22.04"));
        assert_eq!(fields.get("id").map(String::as_str), Some("ubuntu"));
    }

    #[test]
    fn dpkg_rows_filtered_by_manual_set() {
        let manual: HashSet<&str> = ["nginx", "postgresql"].into_iter().collect();
        let out = "\
Desired=Unknown/Install/Remove/Purge/Hold
ii  nginx          1.18.0-6ubuntu14  amd64  small, powerful, scalable web/proxy server
ii  libc6          2.35-0ubuntu3     amd64  GNU C Library
rc  old-package    1.0               amd64  removed
ii  postgresql     14+238            all    object-relational SQL database
";
        let packages = parse_dpkg(out, &manual);
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "nginx");
        assert_eq!(packages[0].version, "1.18.0-6ubuntu14");
        assert_eq!(packages[0].architecture.as_deref(), Some("amd64"));
        assert_eq!(packages[1].name, "postgresql");
    }

    #[test]
    fn rpm_rows_parse() {
        let out = "openssh 8.7p1-38.el9 x86_64\nbash 5.1.8-9.el9 x86_64\nshort\n";
        let packages = parse_rpm(out, None);
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].version, "8.7p1-38.el9");
        assert_eq!(packages[0].source, "rpm");
    }

    #[test]
    fn rpm_rows_filtered_by_userinstalled() {
        let set: HashSet<String> = ["openssh".to_string()].into_iter().collect();
        let out = "openssh 8.7p1-38.el9 x86_64\nbash 5.1.8-9.el9 x86_64\n";
        let packages = parse_rpm(out, Some(&set));
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "openssh");
        assert_eq!(packages[0].source, "dnf/yum");
    }

    #[test]
    fn userinstalled_listing_parses_to_names() {
        let out = "\
Packages installed by user
containerd.io-2.2.1-1.el9.x86_64
htop-3.2.1-1.el9.x86_64

";
        let names = parse_user_installed(out);
        assert_eq!(names.len(), 2);
        assert!(names.contains("containerd.io"));
        assert!(names.contains("htop"));
    }

    #[test]
    fn nevra_names_strip_version_suffix() {
        assert_eq!(nevra_name("containerd.io-2.2.1-1.el9.x86_64"), "containerd.io");
        assert_eq!(nevra_name("gcc-c++-11.4.1-3.el9.x86_64"), "gcc-c++");
        assert_eq!(nevra_name("kernel"), "kernel");
    }

    #[test]
    fn passwd_accounts_flag_system_users() {
        let text = "root:x:0:0:root:/root:/bin/bash\n\
                    svc:x:999:999::/nonexistent:/usr/sbin/nologin\n\
                    alice:x:1000:1000:Alice:/home/alice:/bin/zsh\n\
                    malformed:x:abc\n";
        let users = parse_passwd_accounts(text);
        assert_eq!(users.len(), 3);
        assert!(users[0].system);
        assert!(users[1].system);
        assert!(!users[2].system);
        assert_eq!(users[2].home, "/home/alice");
    }

    #[test]
    fn iptables_rows_parse_after_header() {
        let out = "\
Chain INPUT (policy ACCEPT 12 packets, 720 bytes)
num   pkts bytes target     prot opt in     out     source               destination
1       42  2520 ACCEPT     tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            tcp dpt:22
2        0     0 DROP       all  --  eth0   *       10.0.0.0/8           0.0.0.0/0
";
        let rules = parse_iptables(out);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].number, Some(1));
        assert_eq!(rules[0].target.as_deref(), Some("ACCEPT"));
        assert_eq!(rules[0].protocol.as_deref(), Some("tcp"));
        assert_eq!(rules[0].source.as_deref(), Some("0.0.0.0/0"));
        assert_eq!(rules[0].detail.as_deref(), Some("tcp dpt:22"));
        assert_eq!(rules[1].in_interface.as_deref(), Some("eth0"));
        assert!(rules[1].detail.is_none());
    }

    #[test]
    fn ufw_rules_pick_action() {
        let out = "\
Status: active
Default: deny (incoming), allow (outgoing), disabled (routed)

To                         Action      From
--                         ------      ----
22/tcp                     ALLOW IN    Anywhere
23/tcp                     DENY IN     Anywhere
80/tcp                     LIMIT IN    Anywhere
";
        let rules = parse_ufw(out);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].action, "ALLOW");
        assert_eq!(rules[1].action, "DENY");
        assert_eq!(rules[2].action, "LIMIT");
    }

    #[test]
    fn service_units_parse() {
        let out = "\
  UNIT                  LOAD   ACTIVE SUB     DESCRIPTION
  cron.service          loaded active running Regular background program processing daemon
  ssh.service           loaded active running OpenBSD Secure Shell server

LOAD   = Reflects whether the unit definition was properly loaded.
2 loaded units listed.
";
        let services = parse_service_units(out);
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "cron.service");
        assert_eq!(services[0].sub.as_deref(), Some("running"));
    }

    #[test]
    fn statvfs_reads_root() {
        let (total, free) = statvfs_bytes(Path::new("/")).unwrap();
        assert!(total > 0);
        assert!(free <= total);
    }

    #[test]
    fn unreadable_passwd_degrades_to_error() {
        let section = collect_users_from(Path::new("/nonexistent/hostinv-passwd"));
        assert!(section.users.is_empty());
        assert!(section.error.is_some());
    }

    #[tokio::test]
    async fn missing_firewall_tools_degrade_to_error() {
        let section = collect_firewall_with("hostinv-no-iptables", "hostinv-no-ufw").await;
        assert!(section.iptables_input.is_empty());
        assert!(section.iptables_output.is_empty());
        assert!(section.ufw_rules.is_empty());
        let err = section.error.expect("every backend failed");
        assert!(err.contains("failed to start"), "{err}");
    }

    #[test]
    fn cpuinfo_counts_cores_and_reads_model() {
        let text = "\
processor   : 0
model name  : Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz
cpu MHz     : 2399.998
physical id : 0
core id     : 0

processor   : 1
model name  : Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz
cpu MHz     : 2399.998
physical id : 0
core id     : 0
";
        let section = parse_cpuinfo(text);
        assert_eq!(section.logical_cores, 2);
        assert_eq!(section.physical_cores, Some(1));
        assert!(section.model_name.unwrap().starts_with("Intel(R) Xeon"));
        assert_eq!(section.mhz, Some(2399.998));
    }

    #[test]
    fn cpuinfo_without_topology_keys_leaves_physical_unknown() {
        let text = "processor : 0\nmodel name : QEMU Virtual CPU\n";
        let section = parse_cpuinfo(text);
        assert_eq!(section.logical_cores, 1);
        assert_eq!(section.physical_cores, None);
    }

    #[test]
    fn unit_files_listed_from_systemctl_output() {
        let out = "\
UNIT FILE                              STATE           PRESET
cron.service                           enabled         enabled
ssh.service                            enabled         enabled
systemd-fsckd.service                  static          -

3 unit files listed.
";
        let units = unit_file_names(out);
        assert_eq!(
            units,
            vec!["cron.service", "ssh.service", "systemd-fsckd.service"]
        );
    }

    #[test]
    fn unit_dependency_properties_parse() {
        let out = "\
Requires=sysinit.target system.slice
Wants=network-online.target
RequiredBy=
WantedBy=multi-user.target
After=network.target sysinit.target
Before=shutdown.target
Conflicts=shutdown.target
ActiveState=active
Description=OpenBSD Secure Shell server
FragmentPath=/lib/systemd/system/ssh.service
";
        let deps = parse_unit_dependencies("ssh.service", out);
        assert_eq!(deps.unit, "ssh.service");
        assert_eq!(deps.requires, vec!["sysinit.target", "system.slice"]);
        assert_eq!(deps.wants, vec!["network-online.target"]);
        assert!(deps.required_by.is_empty());
        assert_eq!(deps.wanted_by, vec!["multi-user.target"]);
        assert_eq!(deps.active_state.as_deref(), Some("active"));
        assert_eq!(
            deps.fragment_path.as_deref(),
            Some("/lib/systemd/system/ssh.service")
        );
    }

    #[test]
    fn docker_json_lines_parse_and_skip_garbage() {
        let out = r#"{"ID":"1a2b3c4d5e","Image":"nginx:1.25","Names":"web","Status":"Up 3 hours","Ports":"0.0.0.0:8080->80/tcp","Command":"nginx -g"}
{"ID":"6f7a8b9c0d","Image":"postgres:16","Names":"db","Status":"Up 3 hours","Ports":"5432/tcp"}
not json
"#;
        let containers: Vec<DockerContainer> = parse_json_lines(out);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].names, "web");
        assert_eq!(containers[0].ports, "0.0.0.0:8080->80/tcp");
        assert_eq!(containers[1].image, "postgres:16");
    }

    #[test]
    fn top_processes_sorted_and_capped() {
        let entry = |pid, rss_kb| TopProcess {
            pid,
            name: format!("p{pid}"),
            username: None,
            rss_kb,
            memory_percent: 0.0,
        };
        let top = top_by_rss(vec![entry(1, 10), entry(2, 30), entry(3, 20)], 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].pid, 2);
        assert_eq!(top[1].pid, 3);
    }

    #[test]
    fn own_process_appears_in_listing() {
        let section = collect_processes(usize::MAX);
        assert!(section.error.is_none());
        let own = std::process::id() as i32;
        let me = section
            .processes
            .iter()
            .find(|p| p.pid == own)
            .expect("own pid listed");
        assert!(me.rss_kb > 0);
    }
}
