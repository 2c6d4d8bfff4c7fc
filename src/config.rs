use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_PORT: u16 = 3141;
pub const DEFAULT_COMMAND_PORT: u16 = 3142;
pub const DEFAULT_MANAGER_PORT: u16 = 5926;
pub const DEFAULT_PROBE_PORT: u16 = 2613;

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_state_port() -> u16 {
    DEFAULT_STATE_PORT
}

fn default_command_port() -> u16 {
    DEFAULT_COMMAND_PORT
}

fn default_manager_port() -> u16 {
    DEFAULT_MANAGER_PORT
}

fn default_probe_port() -> u16 {
    DEFAULT_PROBE_PORT
}

fn default_indexes() -> u32 {
    1
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    tracing::trace!(path = %path.display(), "Loading configuration");
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", path.display()))
}

/// One supervised program of the daemon's role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDefinition {
    /// Component name reported to the manager (e.g. "gw", "st1")
    pub name: String,
    /// Executable path
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    /// Exported as LD_LIBRARY_PATH for this program only
    pub ld_library_path: Option<String>,
    /// Started by `load()` without waiting for a START command
    #[serde(default)]
    pub autostart: bool,
}

impl ProcessDefinition {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            ld_library_path: None,
            autostart: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    /// File name of the executable, used to recognise the program in /proc.
    pub fn program_name(&self) -> &str {
        Path::new(&self.command)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.command)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Emulated entity hosted here (gw, sat, st, ws)
    pub role: String,
    pub instance: Option<u8>,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_state_port")]
    pub state_port: u16,
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    #[serde(default = "crate::clienv::state_file_path")]
    pub state_file: PathBuf,
    #[serde(default, rename = "process")]
    pub processes: Vec<ProcessDefinition>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = read_toml(path)?;
        config.validate()?;
        tracing::debug!(
            role = %config.role,
            processes = config.processes.len(),
            "Daemon config loaded"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for process in &self.processes {
            if process.name.trim().is_empty() || process.name.contains(char::is_whitespace) {
                anyhow::bail!("Invalid process name '{}'", process.name);
            }
            if !seen.insert(process.name.as_str()) {
                anyhow::bail!("Process '{}' is defined twice", process.name);
            }
        }
        Ok(())
    }

    /// Name published for this host, e.g. "st3" or "gw".
    pub fn host_name(&self) -> String {
        match self.instance {
            Some(id) if self.role != "gw" => format!("{}{}", self.role, id),
            _ => self.role.clone(),
        }
    }

    pub fn state_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.state_port)
    }

    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.command_port)
    }
}

/// A daemon known to the manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    pub name: String,
    pub address: IpAddr,
    #[serde(default = "default_state_port")]
    pub state_port: u16,
    #[serde(default = "default_command_port")]
    pub command_port: u16,
}

impl HostConfig {
    pub fn state_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.state_port)
    }

    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.command_port)
    }
}

/// A statistic published by a component, with its number of indexes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Component name as decoded from datagrams (GW, SAT, ST3)
    pub component: String,
    pub stat_id: u8,
    pub name: String,
    #[serde(default = "default_indexes")]
    pub indexes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_manager_port")]
    pub command_port: u16,
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,
    #[serde(default, rename = "host")]
    pub hosts: Vec<HostConfig>,
    #[serde(default, rename = "probe")]
    pub probes: Vec<ProbeConfig>,
}

impl ManagerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = read_toml(path)?;
        tracing::debug!(
            hosts = config.hosts.len(),
            probes = config.probes.len(),
            "Manager config loaded"
        );
        Ok(config)
    }

    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.command_port)
    }

    pub fn probe_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.probe_port)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            command_port: DEFAULT_MANAGER_PORT,
            probe_port: DEFAULT_PROBE_PORT,
            hosts: Vec::new(),
            probes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_daemon_config_defaults() {
        let file = write_config(
            r#"
            role = "st"
            instance = 3
            state_file = "/tmp/sand-state.json"

            [[process]]
            name = "st3"
            command = "/usr/bin/sand-st"
            args = ["-i", "3"]
            ld_library_path = "/opt/sand/lib"
            "#,
        );

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.host_name(), "st3");
        assert_eq!(config.state_port, DEFAULT_STATE_PORT);
        assert_eq!(config.command_port, DEFAULT_COMMAND_PORT);
        assert_eq!(config.processes.len(), 1);

        let process = &config.processes[0];
        assert_eq!(process.args, vec!["-i", "3"]);
        assert!(!process.autostart);
        assert_eq!(process.program_name(), "sand-st");
        assert_eq!(process.ld_library_path.as_deref(), Some("/opt/sand/lib"));
    }

    #[test]
    fn test_daemon_config_rejects_duplicate_names() {
        let file = write_config(
            r#"
            role = "gw"

            [[process]]
            name = "gw"
            command = "/bin/true"

            [[process]]
            name = "gw"
            command = "/bin/false"
            "#,
        );

        let err = DaemonConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_gateway_host_name_ignores_instance() {
        let file = write_config("role = \"gw\"\ninstance = 0\n");
        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.host_name(), "gw");
    }

    #[test]
    fn test_manager_config_reads_hosts() {
        let file = write_config(
            r#"
            [[host]]
            name = "gw"
            address = "192.168.1.10"
            state_port = 4000

            [[probe]]
            component = "ST3"
            stat_id = 7
            name = "cni"
            indexes = 2
            "#,
        );

        let config = ManagerConfig::load(file.path()).unwrap();
        assert_eq!(config.probe_port, DEFAULT_PROBE_PORT);
        assert_eq!(config.hosts.len(), 1);
        let host = &config.hosts[0];
        assert_eq!(host.state_addr(), "192.168.1.10:4000".parse().unwrap());
        assert_eq!(host.command_port, DEFAULT_COMMAND_PORT);
        assert_eq!(config.probes[0].indexes, 2);
    }

    #[test]
    fn test_process_definition_builder() {
        let def = ProcessDefinition::new("sat", "/usr/bin/sand-sat")
            .args(["--verbose"])
            .env("SAND_LOG", "debug")
            .autostart(true);

        assert_eq!(def.args, vec!["--verbose"]);
        assert!(def.env.iter().any(|(k, v)| k == "SAND_LOG" && v == "debug"));
        assert!(def.autostart);
    }
}
