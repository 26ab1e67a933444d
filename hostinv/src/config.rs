#![allow(dead_code)]
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct SnapshotConfig {
    pub out_dir: Option<String>,
    pub pretty: Option<bool>,
    pub summary: Option<bool>,
    pub skip: Option<Vec<String>>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct HistoryConfig {
    pub sysstat_dir: Option<String>,
    pub perflog_dir: Option<String>,
    pub retention_days: Option<u32>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct InstallConfig {
    pub every: Option<u32>,
    pub unit_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub snapshot: Option<SnapshotConfig>,
    pub history: Option<HistoryConfig>,
    pub install: Option<InstallConfig>,
}

pub fn load_config(path: Option<&Path>) -> Option<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("hostinv.yaml");
            if p.exists() { p.to_path_buf() } else { return None; }
        }
    };
    let s = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&s).ok()
}
