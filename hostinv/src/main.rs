use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hostinv_core::history::{build_series, HistoryWindow, UtilizationSeries};
use hostinv_core::report::{build_report, CorrelationReport};
use sw_inventory::{
    CpuSection, DockerSection, FirewallSection, MemorySection, PackageSection,
    ServiceDependencySection, ServiceSection, SystemSection, UserSection,
};

mod config;

const RETENTION_DAYS_DEFAULT: u32 = 2;

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new())
}

fn file_stamp() -> String {
    let t = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

#[cfg(unix)]
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

fn parse_date(input: &str) -> Result<time::Date> {
    let parts: Vec<&str> = input.split('-').collect();
    if parts.len() != 3 {
        return Err(anyhow!("invalid date '{}', expected YYYY-MM-DD", input));
    }
    let year: i32 = parts[0].parse().map_err(|_| anyhow!("invalid year in '{}'", input))?;
    let month: u8 = parts[1].parse().map_err(|_| anyhow!("invalid month in '{}'", input))?;
    let day: u8 = parts[2].parse().map_err(|_| anyhow!("invalid day in '{}'", input))?;
    let month = time::Month::try_from(month).map_err(|_| anyhow!("invalid month in '{}'", input))?;
    time::Date::from_calendar_date(year, month, day)
        .map_err(|e| anyhow!("invalid date '{}': {}", input, e))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json }

fn format_from_name(name: &str) -> Option<OutputFormat> {
    match name {
        "text" => Some(OutputFormat::Text),
        "json" => Some(OutputFormat::Json),
        _ => None,
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Section { Packages, Firewall, Users, Services, ServiceDeps, Docker, History }

fn section_from_name(name: &str) -> Option<Section> {
    match name {
        "packages" => Some(Section::Packages),
        "firewall" => Some(Section::Firewall),
        "users" => Some(Section::Users),
        "services" => Some(Section::Services),
        "service-deps" => Some(Section::ServiceDeps),
        "docker" => Some(Section::Docker),
        "history" => Some(Section::History),
        _ => None,
    }
}

#[derive(Debug, Parser)]
#[command(name = "hostinv", version, about = "Host inventory and dependency snapshot tool")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./hostinv.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Collect a full host snapshot (connections, correlation, inventory)
    Snapshot {
        /// Write the JSON document to this file instead of stdout
        #[arg(long, conflicts_with = "out_dir")]
        out: Option<PathBuf>,
        /// Write a timestamped JSON file into this directory
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Pretty-print the JSON document
        #[arg(long)]
        pretty: bool,
        /// Print a human-readable digest on stdout instead of JSON
        #[arg(long)]
        summary: bool,
        /// Skip a collection section (repeatable)
        #[arg(long, value_enum)]
        skip: Vec<Section>,
        /// Stdout format; text is the same digest as --summary (default: json)
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Report previous-day utilization from system activity logs
    History {
        /// Day to report on (YYYY-MM-DD; default: yesterday)
        #[arg(long)]
        date: Option<String>,
        /// Sysstat data directory (default: /var/log/sa, then /var/log/sysstat)
        #[arg(long, conflicts_with = "perflog_dir")]
        sysstat_dir: Option<PathBuf>,
        /// Read Performance Monitor CSV/BLG logs from this directory instead of sar
        #[arg(long)]
        perflog_dir: Option<PathBuf>,
        /// Ignore log files with a modification time older than N days (default: 2)
        #[arg(long)]
        retention_days: Option<u32>,
        /// Output format (default: text)
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Install a systemd service and timer running periodic snapshots
    InstallSchedule {
        /// Hours between snapshot runs, clamped to 1-24 (default: 6)
        #[arg(long)]
        every: Option<u32>,
        /// Systemd unit directory (default: /etc/systemd/system)
        #[arg(long)]
        unit_dir: Option<PathBuf>,
        /// Render the unit files to stdout without writing or enabling anything
        #[arg(long)]
        print_only: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let loaded_cfg = config::load_config(cli.config.as_deref());
    match cli.command {
        Commands::Version => {
            println!("hostinv {} (core {})", env!("CARGO_PKG_VERSION"), hostinv_core::version());
        }
        Commands::Snapshot { mut out, mut out_dir, mut pretty, mut summary, mut skip, mut format } => {
            if let Some(cfg) = &loaded_cfg {
                if let Some(s) = &cfg.snapshot {
                    if out.is_none() && out_dir.is_none() {
                        out_dir = s.out_dir.as_ref().map(PathBuf::from);
                    }
                    if !pretty { pretty = s.pretty.unwrap_or(false); }
                    if !summary { summary = s.summary.unwrap_or(false); }
                    if skip.is_empty() {
                        if let Some(names) = &s.skip {
                            skip = names.iter().filter_map(|n| section_from_name(n)).collect();
                        }
                    }
                    if format.is_none() {
                        format = s.format.as_deref().and_then(format_from_name);
                    }
                }
            }
            let digest = summary || format == Some(OutputFormat::Text);
            if !is_root() {
                warn!("not running as root; socket owners and some inventory may be incomplete");
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async move {
                let history = if skip.contains(&Section::History) {
                    UtilizationSeries::unavailable("collection skipped")
                } else {
                    let source = usage_logs::SysstatSource::new();
                    build_series(&source, &HistoryWindow::previous_day(), RETENTION_DAYS_DEFAULT)
                        .await
                };
                let report = match net_facts::ProcFacts::collect() {
                    Ok(facts) => build_report(&facts, history),
                    Err(e) => {
                        warn!(error = %e, "connection enumeration failed");
                        CorrelationReport {
                            cpu_history: history,
                            error: Some(e.to_string()),
                            ..Default::default()
                        }
                    }
                };
                let system = sw_inventory::collect_system();
                let cpu = sw_inventory::collect_cpu();
                let memory = sw_inventory::collect_memory();
                let disks = sw_inventory::collect_disks();
                let interfaces = sw_inventory::collect_interfaces();
                let processes = sw_inventory::collect_processes(50);
                let packages = if skip.contains(&Section::Packages) {
                    None
                } else {
                    Some(sw_inventory::collect_packages().await)
                };
                let users = if skip.contains(&Section::Users) {
                    None
                } else {
                    Some(sw_inventory::collect_users())
                };
                let firewall = if skip.contains(&Section::Firewall) {
                    None
                } else {
                    Some(sw_inventory::collect_firewall().await)
                };
                let services = if skip.contains(&Section::Services) {
                    None
                } else {
                    Some(sw_inventory::collect_services().await)
                };
                let service_deps = if skip.contains(&Section::ServiceDeps) {
                    None
                } else {
                    Some(sw_inventory::collect_service_dependencies().await)
                };
                let docker = if skip.contains(&Section::Docker) {
                    None
                } else {
                    Some(sw_inventory::collect_docker().await)
                };

                let mut doc = serde_json::json!({
                    "collected_at": now_rfc3339(),
                    "system": &system,
                    "cpu": &cpu,
                    "memory": &memory,
                    "disks": &disks,
                    "interfaces": &interfaces,
                    "processes": &processes,
                    "listening_services": &report.listening_services,
                    "service_to_ports": &report.service_to_ports,
                    "port_usage_map": &report.port_usage_map,
                    "communication_matrix": &report.communication_matrix,
                    "by_process": &report.by_process,
                    "service_clients": &report.service_clients,
                    "stats": &report.stats,
                    "dependency_graph": &report.dependency_graph,
                    "cpu_history": &report.cpu_history,
                });
                if let Some(p) = &packages { doc["packages"] = serde_json::to_value(p)?; }
                if let Some(u) = &users { doc["users"] = serde_json::to_value(u)?; }
                if let Some(f) = &firewall { doc["firewall"] = serde_json::to_value(f)?; }
                if let Some(s) = &services { doc["services"] = serde_json::to_value(s)?; }
                if let Some(d) = &service_deps {
                    doc["service_dependencies"] = serde_json::to_value(d)?;
                }
                if let Some(d) = &docker { doc["docker"] = serde_json::to_value(d)?; }
                if let Some(e) = &report.error { doc["error"] = serde_json::json!(e); }

                let rendered = if pretty {
                    serde_json::to_string_pretty(&doc)?
                } else {
                    serde_json::to_string(&doc)?
                };
                let out_path = match (out, out_dir) {
                    (Some(p), _) => Some(p),
                    (None, Some(dir)) => {
                        std::fs::create_dir_all(&dir)?;
                        Some(dir.join(format!("hostinv-{}.json", file_stamp())))
                    }
                    (None, None) => None,
                };
                if let Some(path) = &out_path {
                    let file =
                        OpenOptions::new().create(true).truncate(true).write(true).open(path)?;
                    let mut w = BufWriter::new(file);
                    writeln!(w, "{}", rendered)?;
                    info!(path = %path.display(), "snapshot written");
                }
                if digest {
                    print_summary(
                        &report,
                        &system,
                        &cpu,
                        &memory,
                        packages.as_ref(),
                        users.as_ref(),
                        firewall.as_ref(),
                        services.as_ref(),
                        service_deps.as_ref(),
                        docker.as_ref(),
                    );
                } else if out_path.is_none() {
                    println!("{}", rendered);
                }
                Ok::<(), anyhow::Error>(())
            })?;
        }
        Commands::History { date, mut sysstat_dir, mut perflog_dir, mut retention_days, mut format } => {
            if let Some(cfg) = &loaded_cfg {
                if let Some(h) = &cfg.history {
                    if sysstat_dir.is_none() && perflog_dir.is_none() {
                        sysstat_dir = h.sysstat_dir.as_ref().map(PathBuf::from);
                        perflog_dir = h.perflog_dir.as_ref().map(PathBuf::from);
                    }
                    if retention_days.is_none() { retention_days = h.retention_days; }
                    if format.is_none() {
                        format = h.format.as_deref().and_then(format_from_name);
                    }
                }
            }
            let retention = retention_days.unwrap_or(RETENTION_DAYS_DEFAULT);
            let window = match &date {
                Some(s) => HistoryWindow::for_date(parse_date(s)?),
                None => HistoryWindow::previous_day(),
            };
            let rt = tokio::runtime::Runtime::new()?;
            let series = rt.block_on(async move {
                match perflog_dir {
                    Some(dir) => {
                        let source = usage_logs::PerfLogSource::new(dir);
                        build_series(&source, &window, retention).await
                    }
                    None => {
                        let source = match sysstat_dir {
                            Some(dir) => usage_logs::SysstatSource::with_data_dir(dir),
                            None => usage_logs::SysstatSource::new(),
                        };
                        build_series(&source, &window, retention).await
                    }
                }
            });
            match format.unwrap_or(OutputFormat::Text) {
                OutputFormat::Text => print_series(&series),
                OutputFormat::Json => println!("{}", serde_json::to_string(&series)?),
            }
        }
        Commands::InstallSchedule { mut every, mut unit_dir, print_only } => {
            if let Some(cfg) = &loaded_cfg {
                if let Some(i) = &cfg.install {
                    if every.is_none() { every = i.every; }
                    if unit_dir.is_none() { unit_dir = i.unit_dir.as_ref().map(PathBuf::from); }
                }
            }
            let mut plan =
                sched_install::SchedulePlan::new(every.unwrap_or(6), std::env::current_exe()?);
            if let Some(dir) = unit_dir {
                plan.unit_dir = dir;
            }
            if print_only {
                println!("# {}", sched_install::SERVICE_UNIT);
                print!("{}", plan.render_service());
                println!();
                println!("# {}", sched_install::TIMER_UNIT);
                print!("{}", plan.render_timer());
                return Ok(());
            }
            if !is_root() {
                return Err(anyhow!("install-schedule requires root privileges"));
            }
            let rt = tokio::runtime::Runtime::new()?;
            let outcome = rt.block_on(async move { sched_install::install(&plan).await });
            println!("{}", serde_json::to_string(&outcome)?);
            if let Some(e) = outcome.error {
                return Err(anyhow!("schedule installation failed: {}", e));
            }
        }
    }
    Ok(())
}

fn print_series(series: &UtilizationSeries) {
    if !series.available {
        println!(
            "history unavailable: {}",
            series.error.as_deref().unwrap_or("no reason recorded")
        );
        return;
    }
    if let Some(date) = &series.date {
        println!("date: {}", date);
    }
    for (name, value) in &series.average {
        println!("average {}: {:.2}", name, value);
    }
    println!("samples: {}", series.samples.len());
    for sample in &series.samples {
        let mut line = format!("  {}", sample.timestamp);
        if let Some(v) = sample.cpu_percent {
            line.push_str(&format!("  cpu {:.2}%", v));
        }
        if let Some(v) = sample.memory_available_mb {
            line.push_str(&format!("  mem {:.1} MB", v));
        }
        if let Some(v) = sample.disk_percent {
            line.push_str(&format!("  disk {:.2}%", v));
        }
        println!("{}", line);
    }
}

fn print_summary(
    report: &CorrelationReport,
    system: &SystemSection,
    cpu: &CpuSection,
    memory: &MemorySection,
    packages: Option<&PackageSection>,
    users: Option<&UserSection>,
    firewall: Option<&FirewallSection>,
    services: Option<&ServiceSection>,
    service_deps: Option<&ServiceDependencySection>,
    docker: Option<&DockerSection>,
) {
    let bar = "=".repeat(80);
    println!("{}", bar);
    println!("HOST INVENTORY SUMMARY");
    println!("{}", bar);
    println!();
    println!("Hostname: {}", system.hostname.as_deref().unwrap_or("unknown"));
    println!(
        "Kernel: {} ({})",
        system.kernel.as_deref().unwrap_or("unknown"),
        system.architecture
    );
    println!(
        "CPU: {} ({} cores)",
        cpu.model_name.as_deref().unwrap_or("unknown"),
        cpu.logical_cores
    );
    println!(
        "Memory: {:.1}% used of {} MB",
        memory.used_percent,
        memory.total_bytes / (1024 * 1024)
    );

    let hist = &report.cpu_history;
    if hist.available {
        println!(
            "\nPrevious day CPU utilization ({}):",
            hist.date.as_deref().unwrap_or("unknown date")
        );
        let avg = hist
            .average
            .iter()
            .map(|(k, v)| format!("{} {:.2}", k, v))
            .collect::<Vec<_>>()
            .join("  ");
        if !avg.is_empty() {
            println!("  average: {}", avg);
        }
        println!("  samples: {}", hist.samples.len());
    } else {
        println!(
            "\nPrevious day CPU utilization: {}",
            hist.error.as_deref().unwrap_or("not available")
        );
    }

    println!("\nApplication communication:");
    println!("  processes with connections: {}", report.by_process.len());
    println!("  services with clients: {}", report.service_clients.len());
    println!("  communication paths: {}", report.communication_matrix.len());
    println!(
        "  established {}, local {}, external {}, unattributed {}",
        report.stats.established, report.stats.local, report.stats.external,
        report.stats.unattributed
    );
    let mut by_clients: Vec<(&String, usize)> = report
        .service_clients
        .iter()
        .map(|(name, clients)| (name, clients.len()))
        .collect();
    by_clients.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    if !by_clients.is_empty() {
        println!("\nTop services by client count:");
        for (name, count) in by_clients.iter().take(5) {
            println!("  {}: {} clients", name, count);
        }
    }

    println!("\nListening ports: {}", report.listening_services.len());
    for (port, usage) in report.port_usage_map.iter().take(10) {
        println!(
            "  {}: {} ({}) - {} clients",
            port,
            usage.service.as_deref().unwrap_or("unknown"),
            usage.well_known_label,
            usage.client_count
        );
    }

    if let Some(p) = packages {
        println!("\nPackages: {}", p.packages.len());
    }
    if let Some(u) = users {
        let system_accounts = u.users.iter().filter(|a| a.system).count();
        println!("Users: {} ({} system)", u.users.len(), system_accounts);
    }
    if let Some(f) = firewall {
        println!(
            "Firewall: {} iptables rules, {} ufw rules",
            f.iptables_input.len() + f.iptables_output.len(),
            f.ufw_rules.len()
        );
    }
    if let Some(s) = services {
        let active = s
            .services
            .iter()
            .filter(|unit| unit.active.as_deref() == Some("active"))
            .count();
        println!("Services: {} units ({} active)", s.services.len(), active);
    }
    if let Some(d) = service_deps {
        println!("Service dependencies: {} units mapped", d.services.len());
    }
    if let Some(d) = docker {
        if d.installed {
            println!(
                "Docker: {} containers running, {} networks",
                d.containers.len(),
                d.networks.len()
            );
        }
    }
    println!("\n{}", bar);
}
