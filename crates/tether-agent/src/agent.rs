//! Agent lifecycle
//!
//! `Agent::init` brings up the process runtime (run directory, hook
//! registry, clock calibration), the lifecycle controller, the local
//! IO transport and the service threads: the maintenance loop, the IO
//! output drain and the LCM IPC server. `Agent::stop` unloads every
//! remaining codeletset and joins the threads.

use crate::config::{AgentConfig, IO_DRAIN_TICK_US, MAINTENANCE_TICK_US, STATS_INTERVAL_US};
use crate::epoch;
use crate::hook::{Hook, HookType};
use crate::io::{IoError, LocalTransport, OutputHandler, StreamId, Transport};
use crate::lifecycle::LifecycleController;
use crate::perf;
use crate::runtime::{self, HookRegistryError};
use crate::thread;
use crate::time;
use crate::vm::VmFactory;
use log::{info, warn};
use parking_lot::Mutex;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tether_lcm::api::{CodeletsetLoadReq, CodeletsetUnloadReq, LoadError, UnloadError};
use tether_lcm::server::{LcmServer, LcmServerConfig, ServerHandle};

/// The built-in maintenance hook, fired on every maintenance tick.
pub static PERIODIC_CALL: Hook = Hook::new("periodic_call", HookType::Monitoring);

/// Context handed to `periodic_call` codelets.
#[repr(C)]
pub struct MaintenanceCtx {
    /// Maintenance tick interval in microseconds.
    pub interval_us: u64,
}

/// Failures bringing the agent up.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Run directory or socket setup failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Hook registration failed.
    #[error(transparent)]
    Hooks(#[from] HookRegistryError),
}

/// A running tether agent.
pub struct Agent {
    config: AgentConfig,
    controller: Arc<LifecycleController>,
    transport: Arc<LocalTransport>,
    output_handler: Arc<Mutex<OutputHandler>>,
    maintenance_run: Arc<AtomicBool>,
    maintenance: Option<JoinHandle<()>>,
    io_run: Arc<AtomicBool>,
    io_thread: Option<JoinHandle<()>>,
    lcm_handle: Option<ServerHandle>,
    lcm_thread: Option<JoinHandle<()>>,
    stopped: bool,
}

fn noop_output_handler() -> OutputHandler {
    Arc::new(|_stream_id, _records| {})
}

impl Agent {
    /// Initialize the agent.
    ///
    /// `hooks` are the host's dispatch points; the built-in
    /// `periodic_call` and `report_stats` hooks are registered on top.
    /// `vm_factory` supplies the verifier/JIT backend used for every
    /// codelet load.
    pub fn init(
        config: AgentConfig,
        hooks: &[&'static Hook],
        vm_factory: Box<dyn VmFactory>,
    ) -> Result<Agent, AgentError> {
        info!(
            "initializing tether agent (run dir {})",
            config.namespace_dir().display()
        );

        let namespace_dir = config.namespace_dir();
        std::fs::create_dir_all(&namespace_dir)?;
        std::fs::set_permissions(&namespace_dir, std::fs::Permissions::from_mode(0o777))?;

        time::calibrate();

        let mut all_hooks: Vec<&'static Hook> = vec![&PERIODIC_CALL, &perf::REPORT_STATS];
        all_hooks.extend_from_slice(hooks);
        runtime::global().register_hooks(&all_hooks)?;

        let transport = Arc::new(LocalTransport::new());
        let transport_dyn: Arc<dyn Transport> = transport.clone();
        let controller = Arc::new(LifecycleController::new(vm_factory, transport_dyn));
        let output_handler = Arc::new(Mutex::new(noop_output_handler()));

        let maintenance_run = Arc::new(AtomicBool::new(true));
        let maintenance = {
            let run = maintenance_run.clone();
            let hooks_snapshot = runtime::global().hooks();
            std::thread::Builder::new()
                .name("tether-maint".to_string())
                .spawn(move || maintenance_loop(run, hooks_snapshot))?
        };

        let io_run = Arc::new(AtomicBool::new(config.io.thread_enabled));
        let io_thread = if config.io.thread_enabled {
            let run = io_run.clone();
            let transport = transport.clone();
            let handler = output_handler.clone();
            Some(
                std::thread::Builder::new()
                    .name("tether-io".to_string())
                    .spawn(move || {
                        let _ = thread::register_thread();
                        while run.load(Ordering::Acquire) {
                            let current = handler.lock().clone();
                            transport.handle_out_bufs(&current);
                            std::thread::sleep(Duration::from_micros(IO_DRAIN_TICK_US));
                        }
                    })?,
            )
        } else {
            None
        };

        let (lcm_handle, lcm_thread) = if config.lcm.enabled {
            let load_ctl = controller.clone();
            let unload_ctl = controller.clone();
            let server = LcmServer::bind(LcmServerConfig {
                address: config.lcm_socket_path(),
                load_cb: Box::new(move |req| load_ctl.load(req)),
                unload_cb: Box::new(move |req| unload_ctl.unload(req)),
            })?;
            let handle = server.handle();
            let thread = std::thread::Builder::new()
                .name("tether-lcm-ipc".to_string())
                .spawn(move || {
                    let _ = thread::register_thread();
                    server.run();
                })?;
            (Some(handle), Some(thread))
        } else {
            (None, None)
        };

        Ok(Agent {
            config,
            controller,
            transport,
            output_handler,
            maintenance_run,
            maintenance: Some(maintenance),
            io_run,
            io_thread,
            lcm_handle,
            lcm_thread,
            stopped: false,
        })
    }

    /// The agent's configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The lifecycle controller, for embedding hosts that drive loads
    /// programmatically instead of over IPC.
    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// The in-process IO transport.
    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    /// Load a codeletset.
    pub fn load_codeletset(&self, req: &CodeletsetLoadReq) -> Result<(), LoadError> {
        self.controller.load(req)
    }

    /// Unload a codeletset.
    pub fn unload_codeletset(&self, req: &CodeletsetUnloadReq) -> Result<(), UnloadError> {
        self.controller.unload(req)
    }

    /// Install the callback receiving batches of committed output
    /// records. Replaces the previous handler.
    pub fn register_output_handler(&self, handler: OutputHandler) {
        *self.output_handler.lock() = handler;
    }

    /// Feed one record into the control-input channel bound to
    /// `stream_id`.
    pub fn send_input(&self, stream_id: &StreamId, data: &[u8]) -> Result<(), IoError> {
        self.transport.send_input(stream_id, data)
    }

    /// Toggle perf recording for a hook by name.
    pub fn set_perf_active(&self, hook_name: &str, active: bool) -> bool {
        match runtime::global().find_hook(hook_name) {
            Some(hook) => {
                hook.set_perf_active(active);
                true
            }
            None => false,
        }
    }

    /// Unload everything and join the service threads.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("stopping tether agent");

        self.controller.unload_all();

        if let Some(handle) = self.lcm_handle.take() {
            handle.stop();
        }
        if let Some(thread) = self.lcm_thread.take() {
            if thread.join().is_err() {
                warn!("LCM IPC thread panicked during shutdown");
            }
        }

        self.io_run.store(false, Ordering::Release);
        if let Some(thread) = self.io_thread.take() {
            if thread.join().is_err() {
                warn!("IO thread panicked during shutdown");
            }
        }

        self.maintenance_run.store(false, Ordering::Release);
        if let Some(thread) = self.maintenance.take() {
            if thread.join().is_err() {
                warn!("maintenance thread panicked during shutdown");
            }
        }

        // Nothing references retired objects anymore.
        epoch::domain().barrier();
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn maintenance_loop(run: Arc<AtomicBool>, hooks: Vec<&'static Hook>) {
    let _ = thread::register_thread();
    let domain = epoch::domain();
    let mut last_stats = time::start_time();

    while run.load(Ordering::Acquire) {
        for record in 0..domain.num_records() {
            domain.poll(record);
        }

        let now = time::stop_time();
        if time::diff_ns(last_stats, now) > STATS_INTERVAL_US * 1_000 {
            last_stats = time::start_time();
            perf::report_perf_stats(&hooks, STATS_INTERVAL_US);
        }

        let mut ctx = MaintenanceCtx {
            interval_us: MAINTENANCE_TICK_US,
        };
        PERIODIC_CALL.dispatch(&mut ctx);

        std::thread::sleep(Duration::from_micros(MAINTENANCE_TICK_US));
    }
    thread::cleanup_thread();
}
