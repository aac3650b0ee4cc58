#![allow(dead_code)]

use std::time::Duration;

use ein_llm::pool::{PoolConfig, RestartPolicy, WorkerCommand, WorkerPool};

pub const FAIL_MARKER: &str = "please-fail";
pub const CRASH_MARKER: &str = "please-crash";

/// Command that runs this crate's binary as an echo-backend worker.
pub fn echo_worker(extra: &[&str]) -> WorkerCommand {
    let mut args: Vec<String> = ["--log-level", "warning", "worker", "--backend", "echo"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend(extra.iter().map(|s| s.to_string()));
    WorkerCommand::new(env!("CARGO_BIN_EXE_ein-llm"), args)
}

pub fn echo_config(extra: &[&str]) -> PoolConfig {
    let mut flags = vec!["--echo-fail-marker", FAIL_MARKER, "--echo-crash-marker", CRASH_MARKER];
    flags.extend_from_slice(extra);
    PoolConfig::new(echo_worker(&flags)).with_start_timeout(Duration::from_secs(30))
}

pub async fn start_pool(size: usize, restart: RestartPolicy, extra: &[&str]) -> WorkerPool {
    WorkerPool::start(echo_config(extra).with_size(size).with_restart(restart))
        .await
        .unwrap()
}
