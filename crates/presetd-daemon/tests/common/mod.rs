//! Helpers shared by the daemon integration tests.
//!
//! Workers are `sh`: the argv `sh -c <script> --port N` runs `<script>`,
//! so a run spec's `config` field carries the worker's behaviour.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::time::Duration;

use presetd_daemon::orchestration::RunnerOptions;
use presetd_daemon::subprocess::{InstanceOptions, RunSpec};
use tokio::net::TcpListener;

/// Options with delays short enough for tests.
pub fn fast_options() -> InstanceOptions {
    InstanceOptions {
        default_executable: "sh".to_string(),
        startup_delay: Duration::from_millis(50),
        hook_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_millis(500),
        reconnect_delay: Duration::from_millis(100),
        event_capacity: 16,
    }
}

pub fn runner_options(max_instances: usize) -> RunnerOptions {
    RunnerOptions {
        max_instances,
        instance: fast_options(),
        channel_capacity: 16,
    }
}

/// A worker that runs `script` and talks to `port`.
pub fn worker(script: &str, port: u16) -> RunSpec {
    RunSpec {
        executable: Some(PathBuf::from("sh")),
        config: Some(PathBuf::from(script)),
        tcp_port: port,
        ..RunSpec::default()
    }
}

pub fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// A local port standing in for a worker's control port.
pub async fn control_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let (listener, port) = control_port().await;
    drop(listener);
    port
}

pub fn log_sink() -> (tempfile::NamedTempFile, std::fs::File) {
    let log = tempfile::NamedTempFile::new().unwrap();
    let sink = log.reopen().unwrap();
    (log, sink)
}

pub fn read_lines(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

pub const WAIT: Duration = Duration::from_secs(10);
