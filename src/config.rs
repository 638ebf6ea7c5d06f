//! Daemon-level configuration: idle timers, listen addresses, resource
//! defaults. Read from the environment with `XDG_STATE_HOME`-style
//! defaults, following the state-directory convention the rest of the
//! pack uses for long-running daemons.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the daemon's state directory.
pub const STATE_DIR_ENV: &str = "AEGISVM_STATE_DIR";

fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".local/state/aegisvm")
}

/// Daemon-wide configuration, independent of any one instance's desired
/// spec.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Directory holding the instance registry and logs.
    pub state_dir: PathBuf,
    /// Unix socket the control API listens on.
    pub control_socket_path: PathBuf,
    /// Address the public wake-on-connect proxy listens on.
    pub proxy_addr: std::net::SocketAddr,
    /// Idle time in `RUNNING` before an instance is paused.
    pub pause_after_idle: Duration,
    /// Additional idle time in `PAUSED` before an instance is stopped.
    pub stop_after_idle: Duration,
    /// Default memory, in MB, for instances that don't override it.
    pub default_memory_mb: u32,
    /// Default vCPU count for instances that don't override it.
    pub default_vcpus: u32,
    /// Capacity of each instance's tether ring buffer.
    pub tether_buffer_capacity: usize,
    /// Capacity of each tether subscriber channel.
    pub tether_subscriber_capacity: usize,
    /// Deadline for the boot-time `run` RPC.
    pub boot_timeout: Duration,
    /// Deadline for the best-effort `shutdown` RPC.
    pub shutdown_timeout: Duration,
    /// Deadline for `Ensure` as called from the router.
    pub ensure_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let state_dir = default_state_dir();
        Self {
            control_socket_path: state_dir.join("control.sock"),
            state_dir,
            proxy_addr: "127.0.0.1:8099".parse().expect("valid default proxy addr"),
            pause_after_idle: Duration::from_secs(60),
            stop_after_idle: Duration::from_secs(20 * 60),
            default_memory_mb: 128,
            default_vcpus: 1,
            tether_buffer_capacity: 1000,
            tether_subscriber_capacity: 100,
            boot_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            ensure_timeout: Duration::from_secs(30),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("AEGISVM_PROXY_ADDR") {
            if let Ok(addr) = v.parse() {
                cfg.proxy_addr = addr;
            }
        }
        if let Ok(v) = std::env::var("AEGISVM_PAUSE_AFTER_IDLE_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.pause_after_idle = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("AEGISVM_STOP_AFTER_IDLE_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.stop_after_idle = Duration::from_secs(secs);
            }
        }
        cfg.control_socket_path = cfg.state_dir.join("control.sock");
        cfg
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("instances")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.runs_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.default_memory_mb, 128);
        assert_eq!(cfg.pause_after_idle, Duration::from_secs(60));
        assert_eq!(cfg.stop_after_idle, Duration::from_secs(20 * 60));
    }
}
