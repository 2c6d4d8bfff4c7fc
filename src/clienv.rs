use std::path::PathBuf;

const FALLBACK_CONFIG_DIR: &str = "/etc";
const SAND_SUBDIR: &str = "sand";
const DEFAULT_STATE_FILE: &str = "/var/cache/sand-daemon/process.json";

const SAND_CONFIG_DIR: &str = "SAND_CONFIG_DIR";
const SAND_DAEMON_CONFIG: &str = "SAND_DAEMON_CONFIG";
const SAND_MANAGER_CONFIG: &str = "SAND_MANAGER_CONFIG";
const SAND_STATE_FILE: &str = "SAND_STATE_FILE";

/// Non-empty value of an environment variable.
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Configuration directory ($SAND_CONFIG_DIR or ~/.config/sand)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(SAND_CONFIG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(SAND_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Daemon configuration file ($SAND_DAEMON_CONFIG or <config dir>/daemon.toml)
pub fn daemon_config_path() -> PathBuf {
    let path = env_opt(SAND_DAEMON_CONFIG)
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join("daemon.toml"));
    tracing::trace!(path = %path.display(), "Daemon config path");
    path
}

/// Manager configuration file ($SAND_MANAGER_CONFIG or <config dir>/manager.toml)
pub fn manager_config_path() -> PathBuf {
    let path = env_opt(SAND_MANAGER_CONFIG)
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join("manager.toml"));
    tracing::trace!(path = %path.display(), "Manager config path");
    path
}

/// Persisted process state ($SAND_STATE_FILE or /var/cache/sand-daemon/process.json)
pub fn state_file_path() -> PathBuf {
    let path = env_opt(SAND_STATE_FILE)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
    tracing::trace!(path = %path.display(), "State file path");
    path
}
