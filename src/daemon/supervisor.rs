use crate::config::ProcessDefinition;
use crate::error::SupervisorError;
use crate::protocol::ComponentList;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Grace period between SIGTERM and SIGKILL
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const ADOPTED_EXIT_POLL: Duration = Duration::from_millis(100);
/// Upper bound on waiting for a SIGKILLed recovered process to disappear
const ADOPTED_KILL_WAIT: Duration = Duration::from_secs(1);

type Result<T> = std::result::Result<T, SupervisorError>;

/// Liveness of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Running,
    /// Exited without being asked to
    Crashed,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Running => "running",
            ProcessState::Crashed => "crashed",
        }
    }
}

enum ProcessHandle {
    /// Spawned by this daemon
    Child(Child),
    /// Recovered from the state file of a previous run
    Adopted(u32),
}

impl ProcessHandle {
    fn pid(&self) -> Option<u32> {
        match self {
            ProcessHandle::Child(child) => child.id(),
            ProcessHandle::Adopted(pid) => Some(*pid),
        }
    }
}

pub struct ProcessEntry {
    pub definition: ProcessDefinition,
    pub state: ProcessState,
    handle: Option<ProcessHandle>,
}

impl ProcessEntry {
    fn new(definition: ProcessDefinition) -> Self {
        Self {
            definition,
            state: ProcessState::Stopped,
            handle: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(ProcessHandle::pid)
    }

    fn mark_down(&mut self, state: ProcessState) {
        self.state = state;
        self.handle = None;
    }
}

/// On-disk snapshot of the supervisor, `{name -> liveness}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub processes: BTreeMap<String, PersistedProcess>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedProcess {
    pub state: ProcessState,
    pub pid: Option<u32>,
}

impl PersistedState {
    /// Read a snapshot; a missing or empty file yields `None`.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No process state file at {}", path.display());
                return Ok(None);
            }
            Err(source) => {
                return Err(SupervisorError::Persist {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if content.trim().is_empty() {
            info!("Process state file {} is empty", path.display());
            return Ok(None);
        }
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| SupervisorError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Write through a temporary file so readers never see a partial snapshot.
    pub async fn write(&self, path: &Path) -> Result<()> {
        let persist_err = |source| SupervisorError::Persist {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
            }
        }
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| persist_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await.map_err(persist_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(persist_err)?;
        Ok(())
    }
}

/// Owns every process of the daemon's role and tracks their liveness.
pub struct ProcessSupervisor {
    entries: RwLock<BTreeMap<String, ProcessEntry>>,
    state_file: PathBuf,
    stop_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(definitions: Vec<ProcessDefinition>, state_file: impl Into<PathBuf>) -> Self {
        let entries = definitions
            .into_iter()
            .map(|def| (def.name.clone(), ProcessEntry::new(def)))
            .collect();
        Self {
            entries: RwLock::new(entries),
            state_file: state_file.into(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Force-stop every process, including ones a previous daemon left
    /// behind in the state file, and persist the empty state.
    pub async fn reset(&self) {
        let mut entries = self.entries.write().await;

        for (name, entry) in entries.iter_mut() {
            if let Some(handle) = entry.handle.take() {
                info!("Killing process '{}'", name);
                if let Err(e) = terminate(name, handle, Duration::ZERO).await {
                    warn!("{}", e);
                }
            }
            entry.mark_down(ProcessState::Stopped);
        }

        match PersistedState::read(&self.state_file) {
            Ok(Some(previous)) => {
                for (name, process) in previous.processes {
                    let Some(pid) = process.pid.filter(|_| process.state.is_running()) else {
                        continue;
                    };
                    let Some(entry) = entries.get(&name) else {
                        warn!("Leaving PID {} of unknown process '{}' alone", pid, name);
                        continue;
                    };
                    if pid_alive(pid) && pid_runs(pid, entry.definition.program_name()) {
                        info!("Killing orphan process '{}' (PID {})", name, pid);
                        if let Err(e) = terminate(&name, ProcessHandle::Adopted(pid), Duration::ZERO).await {
                            warn!("{}", e);
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring previous process state: {}", e),
        }

        let snapshot = snapshot(&entries);
        drop(entries);
        if let Err(e) = snapshot.write(&self.state_file).await {
            error!("{}", e);
        }
    }

    /// Recover still-alive processes from the state file, then start every
    /// autostart process that is not running yet.
    pub async fn load(&self) -> Result<()> {
        let previous = PersistedState::read(&self.state_file)?;

        {
            let mut entries = self.entries.write().await;

            if let Some(previous) = previous {
                for (name, process) in previous.processes {
                    let Some(entry) = entries.get_mut(&name) else {
                        debug!("Ignoring unknown process '{}' in state file", name);
                        continue;
                    };
                    if entry.state.is_running() || !process.state.is_running() {
                        continue;
                    }
                    let program = entry.definition.program_name();
                    if let Some(pid) = process.pid.filter(|pid| pid_alive(*pid) && pid_runs(*pid, program)) {
                        info!("Recovered process '{}' (PID {})", name, pid);
                        entry.handle = Some(ProcessHandle::Adopted(pid));
                        entry.state = ProcessState::Running;
                    }
                }
            }

            for (name, entry) in entries.iter_mut() {
                if entry.definition.autostart && !entry.state.is_running() {
                    if let Err(e) = spawn_entry(name, entry) {
                        error!("{}", e);
                    }
                }
            }
        }

        debug!("Process list is initialized");
        self.update(true).await;
        Ok(())
    }

    /// Re-check OS liveness. A process found dead is marked crashed and
    /// leaves the running set; nothing is restarted.
    ///
    /// `deep` additionally checks that a recovered PID still runs the
    /// expected program, which catches PID reuse.
    pub async fn update(&self, deep: bool) {
        let mut entries = self.entries.write().await;

        for (name, entry) in entries.iter_mut() {
            if !entry.state.is_running() {
                continue;
            }
            let program = entry.definition.program_name().to_string();
            let alive = match entry.handle.as_mut() {
                Some(ProcessHandle::Child(child)) => match child.try_wait() {
                    Ok(None) => true,
                    Ok(Some(status)) => {
                        info!("Process '{}' returned {}", name, status);
                        false
                    }
                    Err(e) => {
                        warn!("Cannot poll process '{}': {}", name, e);
                        false
                    }
                },
                Some(ProcessHandle::Adopted(pid)) => {
                    pid_alive(*pid) && (!deep || pid_runs(*pid, &program))
                }
                None => false,
            };

            if !alive {
                warn!("Assume that process '{}' is stopped", name);
                entry.mark_down(ProcessState::Crashed);
            }
        }
    }

    /// Names of the processes running at the last poll.
    pub async fn get_components(&self) -> ComponentList {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(_, e)| e.state.is_running())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub async fn state(&self, name: &str) -> Option<ProcessState> {
        let entries = self.entries.read().await;
        entries.get(name).map(|e| e.state)
    }

    pub async fn pid(&self, name: &str) -> Option<u32> {
        let entries = self.entries.read().await;
        entries.get(name).and_then(ProcessEntry::pid)
    }

    pub async fn is_running(&self) -> bool {
        let entries = self.entries.read().await;
        entries.values().any(|e| e.state.is_running())
    }

    pub async fn snapshot(&self) -> PersistedState {
        let entries = self.entries.read().await;
        snapshot(&entries)
    }

    /// Persist the current state to the state file.
    pub async fn serialize(&self) -> Result<()> {
        let snapshot = self.snapshot().await;
        snapshot.write(&self.state_file).await?;
        debug!("Process state written to {}", self.state_file.display());
        Ok(())
    }

    /// Start one process. Starting a running process is a no-op.
    pub async fn start(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;

        if entry.state.is_running() {
            debug!("Process '{}' is already running", name);
            return Ok(());
        }
        spawn_entry(name, entry)
    }

    /// Stop one process gracefully. Stopping a stopped process is a no-op.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;

        let Some(handle) = entry.handle.take() else {
            entry.mark_down(ProcessState::Stopped);
            return Ok(());
        };
        info!("Stopping process '{}'", name);
        let result = terminate(name, handle, self.stop_timeout).await;
        entry.mark_down(ProcessState::Stopped);
        result
    }

    /// Start every process of the role. On failure the processes started by
    /// this call are stopped again.
    pub async fn start_all(&self) -> Result<()> {
        let names: Vec<String> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, e)| !e.state.is_running())
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut started: Vec<String> = Vec::new();
        for name in names {
            if let Err(e) = self.start(&name).await {
                error!("{}: stopping the processes started so far", e);
                for name in &started {
                    if let Err(e) = self.stop(name).await {
                        warn!("{}", e);
                    }
                }
                return Err(e);
            }
            started.push(name);
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = {
            let entries = self.entries.read().await;
            entries.keys().cloned().collect()
        };
        if names.is_empty() {
            warn!("No process to stop");
        }

        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!("Failed to stop process '{}': {}", name, e);
            }
        }
    }
}

fn snapshot(entries: &BTreeMap<String, ProcessEntry>) -> PersistedState {
    PersistedState {
        processes: entries
            .iter()
            .map(|(name, e)| {
                (
                    name.clone(),
                    PersistedProcess {
                        state: e.state,
                        pid: e.pid(),
                    },
                )
            })
            .collect(),
    }
}

fn spawn_entry(name: &str, entry: &mut ProcessEntry) -> Result<()> {
    let def = &entry.definition;
    let mut cmd = Command::new(&def.command);
    cmd.args(&def.args);

    cmd.envs(def.env.iter().map(|(k, v)| (k, v)));
    if let Some(ref path) = def.ld_library_path {
        debug!("Library path for '{}': {}", name, path);
        cmd.env("LD_LIBRARY_PATH", path);
    }
    if let Some(ref dir) = def.working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());

    match cmd.spawn() {
        Ok(child) => {
            info!("Started process '{}' with PID {:?}", name, child.id());
            entry.handle = Some(ProcessHandle::Child(child));
            entry.state = ProcessState::Running;
            Ok(())
        }
        Err(source) => {
            error!("Failed to start process '{}': {}", name, source);
            entry.mark_down(ProcessState::Crashed);
            Err(SupervisorError::Spawn {
                name: name.to_string(),
                source,
            })
        }
    }
}

/// Stop a process: SIGTERM, then SIGKILL once `grace` has elapsed.
/// A zero grace kills immediately.
async fn terminate(name: &str, handle: ProcessHandle, grace: Duration) -> Result<()> {
    let signal_err = |source| SupervisorError::Signal {
        name: name.to_string(),
        source,
    };

    match handle {
        ProcessHandle::Child(mut child) => {
            if grace.is_zero() {
                return child.kill().await.map_err(signal_err);
            }

            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    send_signal(pid, libc::SIGTERM).map_err(signal_err)?;
                }
            }
            #[cfg(not(unix))]
            {
                child.start_kill().map_err(signal_err)?;
            }

            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => {
                    debug!("Process '{}' stopped gracefully", name);
                    Ok(())
                }
                Err(_) => {
                    warn!("Process '{}' did not stop in time, force killing", name);
                    child.kill().await.map_err(signal_err)
                }
            }
        }
        ProcessHandle::Adopted(pid) => {
            terminate_adopted(pid, grace).map_err(signal_err)?;
            wait_adopted(name, pid, grace).await
        }
    }
}

#[cfg(unix)]
fn terminate_adopted(pid: u32, grace: Duration) -> std::io::Result<()> {
    let signal = if grace.is_zero() {
        libc::SIGKILL
    } else {
        libc::SIGTERM
    };
    match send_signal(pid, signal) {
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        other => other,
    }
}

#[cfg(not(unix))]
fn terminate_adopted(_pid: u32, _grace: Duration) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "cannot signal a recovered process on this platform",
    ))
}

/// Recovered processes are not our children, so exit is observed by polling.
async fn wait_adopted(name: &str, pid: u32, grace: Duration) -> Result<()> {
    if !grace.is_zero() {
        poll_gone(pid, grace).await;
    }
    #[cfg(unix)]
    {
        if !pid_gone(pid) {
            if !grace.is_zero() {
                warn!("Process '{}' did not stop in time, force killing", name);
            }
            if let Err(source) = send_signal(pid, libc::SIGKILL) {
                if source.raw_os_error() != Some(libc::ESRCH) {
                    return Err(SupervisorError::Signal {
                        name: name.to_string(),
                        source,
                    });
                }
            }
        }
    }
    if !poll_gone(pid, ADOPTED_KILL_WAIT).await {
        warn!("Process '{}' (PID {}) still exists after SIGKILL", name, pid);
    }
    Ok(())
}

async fn poll_gone(pid: u32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while !pid_gone(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(ADOPTED_EXIT_POLL).await;
    }
    true
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill(2) has no memory safety requirements.
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Whether a PID exists (signal 0).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    match send_signal(pid, 0) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Dead, or a zombie its parent has not reaped yet.
fn pid_gone(pid: u32) -> bool {
    if !pid_alive(pid) {
        return true;
    }
    if cfg!(target_os = "linux") {
        // Field 3 of /proc/<pid>/stat, after the parenthesised comm.
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_some_and(|state| state == "Z" || state == "X"),
            Err(_) => true,
        }
    } else {
        false
    }
}

/// Whether `pid` still runs `program`, judged by the file name of argv[0].
/// Only Linux exposes the command line; elsewhere the PID is trusted.
fn pid_runs(pid: u32, program: &str) -> bool {
    if cfg!(target_os = "linux") {
        match std::fs::read(format!("/proc/{pid}/cmdline")) {
            Ok(cmdline) => {
                let argv0 = cmdline.split(|b| *b == 0).next().unwrap_or_default();
                let argv0 = String::from_utf8_lossy(argv0);
                Path::new(argv0.as_ref())
                    .file_name()
                    .is_some_and(|name| name == program)
            }
            Err(_) => false,
        }
    } else {
        true
    }
}
