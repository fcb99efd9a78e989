#![cfg(unix)]

mod common;

use common::{machine, spawn_gdb_stub, spawn_qmp_server, unused_port, QmpOptions, StubOptions, PROMPT};
use dosbox_remote::{DosInstance, InstanceConfig, InstanceError, InstanceState};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Writes an executable shell script standing in for the emulator binary.
fn fake_target(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-dosbox");
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_config(target: PathBuf, gdb_port: u16, qmp_port: u16) -> InstanceConfig {
    common::init();
    let mut config = InstanceConfig::default()
        .with_executable(target)
        .with_config("test.conf")
        .with_ports(gdb_port, qmp_port);
    config.kill_pattern = String::new();
    config.key_delay = Duration::from_millis(5);
    config.startup_timeout = Duration::from_secs(3);
    config
}

fn wait_for_file(path: &Path) -> String {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if let Ok(text) = fs::read_to_string(path) {
            if !text.is_empty() {
                return text;
            }
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("{} never written", path.display());
}

fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[test]
fn full_lifecycle_against_fake_servers() -> anyhow::Result<()> {
    let shared = machine();
    let gdb_port = spawn_gdb_stub(shared.clone(), StubOptions::default());
    let qmp_port = spawn_qmp_server(shared.clone(), QmpOptions::default());
    let dir = tempfile::tempdir()?;
    let target = fake_target(dir.path(), "echo \"$@\" > args.txt\nexec sleep 30");
    let config = test_config(target, gdb_port, qmp_port).with_working_dir(dir.path());

    let mut instance = DosInstance::launch(config)?;
    assert_eq!(instance.state(), InstanceState::Running);
    let pid = instance.pid().expect("pid while running");
    assert_eq!(wait_for_file(&dir.path().join("args.txt")).trim(), "-conf test.conf");
    assert!(matches!(instance.start(), Err(InstanceError::AlreadyStarted)));

    assert_eq!(instance.query_status()?["return"]["running"], true);
    instance.qmp()?.stop()?;
    assert_eq!(instance.query_status()?["return"]["status"], "paused");
    instance.qmp()?.cont()?;
    assert_eq!(instance.query_status()?["return"]["running"], true);

    instance.run_command("dir", Duration::ZERO, true)?;
    // Enter clears the fake prompt row again.
    assert_eq!(instance.screen_line(24, 80)?, PROMPT);
    assert_eq!(instance.gdb()?.read_all_registers()?.to_array(), common::REGISTER_VALUES);

    instance.stop();
    assert_eq!(instance.state(), InstanceState::Stopped);
    assert!(instance.pid().is_none());
    assert!(!process_alive(pid));
    assert!(matches!(instance.gdb(), Err(InstanceError::NotRunning)));
    assert!(matches!(instance.qmp(), Err(InstanceError::NotRunning)));
    assert!(shared.lock().unwrap().packets.iter().any(|p| p == "D"));

    // Idempotent.
    instance.stop();
    assert_eq!(instance.state(), InstanceState::Stopped);
    Ok(())
}

#[test]
fn lost_keystrokes_are_reported_before_enter() -> anyhow::Result<()> {
    let shared = machine();
    let gdb_port = spawn_gdb_stub(shared.clone(), StubOptions::default());
    let qmp_port = spawn_qmp_server(shared.clone(), QmpOptions { echo_keys: false, ..QmpOptions::default() });
    let dir = tempfile::tempdir()?;
    let target = fake_target(dir.path(), "exec sleep 30");
    let mut instance = DosInstance::launch(test_config(target, gdb_port, qmp_port))?;

    match instance.run_command("dir", Duration::ZERO, true) {
        Err(InstanceError::CommandNotEchoed { command, line }) => {
            assert_eq!(command, "dir");
            assert_eq!(line, PROMPT);
        }
        other => panic!("expected CommandNotEchoed, got {:?}", other),
    }
    let last_key = shared
        .lock()
        .unwrap()
        .commands
        .iter()
        .rev()
        .find(|c| c["execute"] == "send-key")
        .map(|c| c["arguments"]["keys"][0]["data"].clone());
    assert_eq!(last_key, Some(serde_json::json!("r")));
    // Unverified commands go straight through.
    instance.run_command("cls", Duration::ZERO, false)?;
    assert_eq!(instance.state(), InstanceState::Running);
    Ok(())
}

#[test]
fn startup_times_out_when_ports_never_open() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = fake_target(dir.path(), "exec sleep 30");
    let (gdb_port, qmp_port) = (unused_port(), unused_port());
    let mut config = test_config(target, gdb_port, qmp_port);
    config.startup_timeout = Duration::from_millis(700);
    config.kill_pattern = "dosbox-remote-no-such-process".to_string();

    let started = Instant::now();
    let mut instance = DosInstance::new(config);
    match instance.start() {
        Err(InstanceError::StartupTimeout { gdb_port: g, qmp_port: q, .. }) => {
            assert_eq!((g, q), (gdb_port, qmp_port));
        }
        other => panic!("expected StartupTimeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(instance.state(), InstanceState::Stopped);
    assert!(instance.pid().is_none());
    Ok(())
}

#[test]
fn early_exit_is_reported() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = fake_target(dir.path(), "exit 3");
    let config = test_config(target, unused_port(), unused_port());

    let result = DosInstance::launch(config);
    assert!(matches!(result, Err(InstanceError::ProcessExited(_))));
    Ok(())
}

#[test]
fn missing_executable_fails_to_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path().join("not-there"), unused_port(), unused_port());
    let mut instance = DosInstance::new(config);
    assert!(matches!(instance.start(), Err(InstanceError::Spawn { .. })));
    assert_eq!(instance.state(), InstanceState::Stopped);
}

#[test]
fn unstarted_instance_has_no_clients() {
    let mut instance = DosInstance::new(InstanceConfig::default());
    assert_eq!(instance.state(), InstanceState::NotStarted);
    assert!(matches!(instance.halt(), Err(InstanceError::NotRunning)));
    assert!(matches!(instance.type_text("dir"), Err(InstanceError::NotRunning)));
    instance.stop();
    assert_eq!(instance.state(), InstanceState::NotStarted);
}
