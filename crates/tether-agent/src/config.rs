//! Agent configuration and compile-time limits

use std::path::PathBuf;

/// Maximum number of host threads that may register for hook dispatch.
pub const MAX_REG_THREADS: usize = 32;
/// Maximum number of codelets loaded across all codeletsets.
pub const MAX_LOADED_CODELETS: usize = 64;
/// Maximum number of codeletsets installed at once.
pub const MAX_LOADED_CODELETSETS: usize = 64;
/// Maximum number of maps created across the process.
pub const MAX_NUM_MAPS: usize = 65_535;
/// Maximum number of maps one codelet may declare.
pub const MAX_CODELET_MAPS: usize = 64;
/// Maximum number of hooks the agent accepts at init.
pub const MAX_NUM_HOOKS: usize = 128;
/// Maximum number of output channels across the process.
pub const MAX_OUTPUT_CHANNELS: usize = MAX_LOADED_CODELETS * 4;
/// Maximum number of input channels across the process.
pub const MAX_INPUT_CHANNELS: usize = MAX_LOADED_CODELETS * 4;

/// Maintenance loop tick, microseconds.
pub const MAINTENANCE_TICK_US: u64 = 10_000;
/// Interval between perf aggregation runs, microseconds.
pub const STATS_INTERVAL_US: u64 = 1_000_000;
/// IO output drain cadence, microseconds.
pub const IO_DRAIN_TICK_US: u64 = 100;

/// Entry function name every codelet object must export.
pub const CODELET_ENTRY_FN: &str = "codelet_main";

/// Bounded retry count suggested to codelets for `BUSY` map results.
pub const MAP_RETRY_ATTEMPTS: u32 = 100;

/// Default run directory root.
pub const DEFAULT_RUN_PATH: &str = "/tmp";
/// Default namespace under the run directory.
pub const DEFAULT_NAMESPACE: &str = "tether";
/// Default LCM IPC socket file name.
pub const DEFAULT_LCM_SOCKET: &str = "tether_lcm_ipc";

/// LCM IPC server settings.
#[derive(Debug, Clone)]
pub struct LcmConfig {
    /// Spawn the IPC server thread at init.
    pub enabled: bool,
    /// Socket file name under `<run_path>/<namespace>/`.
    pub socket_name: String,
}

impl Default for LcmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_name: DEFAULT_LCM_SOCKET.to_string(),
        }
    }
}

/// IO service settings.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Spawn the output drain thread at init.
    pub thread_enabled: bool,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            thread_enabled: true,
        }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Root of the run directory.
    pub run_path: PathBuf,
    /// Namespace directory created under `run_path`.
    pub namespace: String,
    /// LCM IPC server settings.
    pub lcm: LcmConfig,
    /// IO service settings.
    pub io: IoConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            run_path: PathBuf::from(DEFAULT_RUN_PATH),
            namespace: DEFAULT_NAMESPACE.to_string(),
            lcm: LcmConfig::default(),
            io: IoConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Directory hosting this agent's sockets:
    /// `<run_path>/<namespace>/`.
    pub fn namespace_dir(&self) -> PathBuf {
        self.run_path.join(&self.namespace)
    }

    /// Full path of the LCM IPC socket.
    pub fn lcm_socket_path(&self) -> PathBuf {
        self.namespace_dir().join(&self.lcm.socket_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_socket_path() {
        let config = AgentConfig::default();
        assert_eq!(
            config.lcm_socket_path(),
            PathBuf::from("/tmp/tether/tether_lcm_ipc")
        );
    }
}
