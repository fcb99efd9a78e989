//! Launches an emulator process and owns the two protocol connections to it.
use crate::config::InstanceConfig;
use crate::gdb_client::GdbClient;
use crate::interfaces::InstanceError;
use crate::qmp_client::QmpClient;
use crate::video::{SCREEN_HEIGHT, SCREEN_WIDTH};
use serde_json::Value;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const KILL_EXISTING_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_EXISTING_SETTLE: Duration = Duration::from_millis(500);
const VERIFY_SETTLE: Duration = Duration::from_millis(200);
const HALT_SETTLE: Duration = Duration::from_millis(100);
/// Row holding the DOS prompt in an 80x25 text screen.
const PROMPT_ROW: usize = SCREEN_HEIGHT - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    NotStarted,
    Starting,
    Running,
    Stopped,
}

/// A running emulator plus its debug and monitor connections.
///
/// Both clients exist only while the process is believed alive. [`stop`]
/// releases everything and is safe to call any number of times; dropping the
/// instance calls it.
///
/// [`stop`]: DosInstance::stop
pub struct DosInstance {
    config: InstanceConfig,
    state: InstanceState,
    process: Option<Child>,
    gdb: Option<GdbClient>,
    qmp: Option<QmpClient>,
}

impl DosInstance {
    pub fn new(config: InstanceConfig) -> Self {
        Self {
            config,
            state: InstanceState::NotStarted,
            process: None,
            gdb: None,
            qmp: None,
        }
    }

    /// Starts an instance with `config`, stopped again on drop.
    pub fn launch(config: InstanceConfig) -> Result<Self, InstanceError> {
        let mut instance = Self::new(config);
        instance.start()?;
        Ok(instance)
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(Child::id)
    }

    pub fn start(&mut self) -> Result<(), InstanceError> {
        if matches!(self.state, InstanceState::Starting | InstanceState::Running) {
            return Err(InstanceError::AlreadyStarted);
        }
        self.state = InstanceState::Starting;
        kill_existing(&self.config.kill_pattern);

        let mut cmd = Command::new(&self.config.executable);
        cmd.arg("-conf")
            .arg(&self.config.config)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.state = InstanceState::Stopped;
                return Err(InstanceError::Spawn {
                    executable: self.config.executable.display().to_string(),
                    source,
                });
            }
        };
        info!(pid = child.id(), executable = %self.config.executable.display(), "Spawned target");
        self.process = Some(child);

        if let Err(e) = self.wait_for_servers() {
            self.stop();
            return Err(e);
        }
        if let Err(e) = self.connect_clients() {
            self.stop();
            return Err(e);
        }
        self.state = InstanceState::Running;
        info!("Target running");
        Ok(())
    }

    fn connect_clients(&mut self) -> Result<(), InstanceError> {
        self.gdb = Some(GdbClient::connect_to(self.config.gdb.clone())?);
        self.qmp = Some(QmpClient::connect_to(self.config.qmp.clone())?);
        Ok(())
    }

    /// Polls both ports until they accept a connection, the process exits,
    /// or the startup deadline passes.
    fn wait_for_servers(&mut self) -> Result<(), InstanceError> {
        let deadline = Instant::now() + self.config.startup_timeout;
        let qmp_addr = self.config.qmp.addr();
        let gdb_addr = self.config.gdb.addr();
        let mut attempts = 0u32;
        while Instant::now() < deadline {
            if let Some(child) = self.process.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => return Err(InstanceError::ProcessExited(status.to_string())),
                    Ok(None) => {}
                    Err(e) => return Err(InstanceError::ProcessExited(e.to_string())),
                }
            }
            attempts += 1;
            if port_open(&qmp_addr, self.config.poll_connect_timeout)
                && port_open(&gdb_addr, self.config.poll_connect_timeout)
            {
                debug!(attempts, "Both servers accepting connections");
                return Ok(());
            }
            thread::sleep(self.config.poll_interval);
        }
        Err(InstanceError::StartupTimeout {
            gdb_port: self.config.gdb.port,
            qmp_port: self.config.qmp.port,
            timeout: self.config.startup_timeout,
        })
    }

    /// Closes both clients and kills the process group. Never fails.
    pub fn stop(&mut self) {
        if let Some(mut gdb) = self.gdb.take() {
            gdb.close();
        }
        if let Some(mut qmp) = self.qmp.take() {
            qmp.close();
        }
        if let Some(mut child) = self.process.take() {
            terminate(&mut child);
            info!(pid = child.id(), "Target stopped");
        }
        if self.state != InstanceState::NotStarted {
            self.state = InstanceState::Stopped;
        }
    }

    pub fn gdb(&mut self) -> Result<&mut GdbClient, InstanceError> {
        self.gdb.as_mut().ok_or(InstanceError::NotRunning)
    }

    pub fn qmp(&mut self) -> Result<&mut QmpClient, InstanceError> {
        self.qmp.as_mut().ok_or(InstanceError::NotRunning)
    }

    pub fn screen_dump(&mut self, width: usize, height: usize) -> Result<Vec<String>, InstanceError> {
        Ok(self.gdb()?.screen_dump(width, height)?)
    }

    pub fn screen_line(&mut self, row: usize, width: usize) -> Result<String, InstanceError> {
        Ok(self.gdb()?.screen_line(row, width)?)
    }

    pub fn halt(&mut self) -> Result<String, InstanceError> {
        Ok(self.gdb()?.halt()?)
    }

    pub fn continue_execution(&mut self) -> Result<String, InstanceError> {
        Ok(self.gdb()?.continue_execution()?)
    }

    pub fn wait_for_stop(&mut self, timeout: Duration) -> Result<String, InstanceError> {
        Ok(self.gdb()?.wait_for_stop(timeout)?)
    }

    pub fn query_status(&mut self) -> Result<Value, InstanceError> {
        Ok(self.qmp()?.query_status()?)
    }

    pub fn debug_break_on_exec(&mut self, enabled: bool) -> Result<Value, InstanceError> {
        Ok(self.qmp()?.debug_break_on_exec(enabled)?)
    }

    /// Types text with the configured inter-key delay. Use `\r` for Enter.
    pub fn type_text(&mut self, text: &str) -> Result<(), InstanceError> {
        let delay = self.config.key_delay;
        self.type_text_with_delay(text, delay)
    }

    pub fn type_text_with_delay(&mut self, text: &str, delay: Duration) -> Result<(), InstanceError> {
        Ok(self.qmp()?.type_text(text, delay)?)
    }

    /// Types `command` and presses Enter.
    ///
    /// With `verify`, the target is halted before Enter and the prompt row is
    /// checked (case-insensitively) for the typed text, so lost keystrokes
    /// surface as [`InstanceError::CommandNotEchoed`] instead of a wrong
    /// command being run.
    pub fn run_command(&mut self, command: &str, wait_after: Duration, verify: bool) -> Result<(), InstanceError> {
        self.type_text(command)?;

        if verify {
            thread::sleep(VERIFY_SETTLE);
            self.halt()?;
            thread::sleep(HALT_SETTLE);
            let line = self.screen_line(PROMPT_ROW, SCREEN_WIDTH);
            self.continue_execution()?;
            thread::sleep(HALT_SETTLE);
            let line = line?;
            if !line.to_uppercase().contains(&command.to_uppercase()) {
                return Err(InstanceError::CommandNotEchoed {
                    command: command.to_string(),
                    line,
                });
            }
        }

        self.type_text("\r")?;
        thread::sleep(wait_after);
        Ok(())
    }
}

impl Drop for DosInstance {
    fn drop(&mut self) {
        self.stop();
    }
}

fn port_open(addr: &str, timeout: Duration) -> bool {
    crate::connect_tcp(addr, timeout).is_ok()
}

/// `pkill -9 -f <pattern>`, bounded and best-effort. An empty pattern
/// disables it.
fn kill_existing(pattern: &str) {
    if pattern.is_empty() {
        return;
    }
    let mut child = match Command::new("pkill")
        .args(["-9", "-f", pattern])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            debug!(error = %e, "pkill unavailable");
            return;
        }
    };
    let deadline = Instant::now() + KILL_EXISTING_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                // pkill exits 1 when nothing matched.
                debug!(%status, pattern, "Cleared stale instances");
                break;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Ok(None) | Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                warn!(pattern, "pkill did not finish in time");
                break;
            }
        }
    }
    thread::sleep(KILL_EXISTING_SETTLE);
}

#[cfg(unix)]
fn kill_group(child: &Child) -> nix::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::{getpgid, getpgrp, Pid};

    let pgid = getpgid(Some(Pid::from_raw(child.id() as i32)))?;
    // Never signal our own group.
    if pgid == getpgrp() {
        return Err(nix::errno::Errno::EPERM);
    }
    killpg(pgid, Signal::SIGKILL)
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    let group_killed = match kill_group(child) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid = child.id(), error = %e, "Process group kill failed, killing process");
            false
        }
    };
    #[cfg(not(unix))]
    let group_killed = false;

    if !group_killed {
        if let Err(e) = child.kill() {
            warn!(pid = child.id(), error = %e, "Failed to kill target");
        }
    }
    if let Err(e) = child.wait() {
        warn!(pid = child.id(), error = %e, "Failed to reap target");
    }
}
