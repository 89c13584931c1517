use serde::Deserialize;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::executor::MAX_PROCS;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub executor: ExecutorConfig,
    pub runtime: RuntimeConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Size of the id pool. 0 selects the maximum.
    pub max_procs: usize,
    /// Control socket inherited from the parent process
    pub conn_file: Option<RawFd>,
    /// UNIX socket of an already running container
    pub daemon_socket: Option<PathBuf>,
    pub container: ContainerConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Directory holding the container and loader binaries
    pub exec_dir: PathBuf,
    pub namespace: NamespaceConfig,
    pub cgroup: CgroupConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NamespaceConfig {
    pub disabled: bool,
    pub single_uid: bool,
    pub newuidmap: String,
    pub newgidmap: String,
    pub container: Option<Cred>,
    pub executor: Option<Cred>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct CgroupConfig {
    /// cgroup the container itself is placed in
    pub container: Option<PathBuf>,
    /// cgroup directory handed to the container with each process
    pub process: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub time_resolution_ms: u64,
    /// Copy the program's debug output to stderr
    pub debug: bool,
    /// Serve deadline; 0 disables it
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub multiplier: u32,
    pub max_attempts: u32,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            exec_dir: PathBuf::from("/usr/lib/gatehouse"),
            namespace: NamespaceConfig::default(),
            cgroup: CgroupConfig::default(),
        }
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            single_uid: false,
            newuidmap: "newuidmap".to_string(),
            newgidmap: "newgidmap".to_string(),
            container: None,
            executor: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            time_resolution_ms: 1,
            debug: false,
            timeout_secs: 0,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 2,
            max_delay_secs: 60,
            multiplier: 2,
            max_attempts: 20,
        }
    }
}

impl ExecutorConfig {
    /// Id pool size after applying the default.
    pub fn effective_max_procs(&self) -> Result<usize> {
        match self.max_procs {
            0 => Ok(MAX_PROCS),
            n if n > MAX_PROCS => Err(Error::Config(format!(
                "max_procs {n} exceeds {MAX_PROCS}"
            ))),
            n => Ok(n),
        }
    }
}

impl RuntimeConfig {
    pub fn time_resolution(&self) -> Duration {
        Duration::from_millis(self.time_resolution_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Parses TOML text after expanding `${ENV_VAR}` references.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = shellexpand::env(content).map_err(|e| Error::Config(e.to_string()))?;
        let config: Config =
            toml::from_str(&expanded).map_err(|e| Error::Config(e.to_string()))?;
        config.executor.effective_max_procs()?;
        Ok(config)
    }
}
