pub mod address;
pub mod config;
mod dispatch;
pub mod error;
pub mod native;
pub mod object;
pub mod patch;
mod process;
pub mod pump;
pub mod runtime;
mod stopgo;
pub mod sync;
pub mod target;
pub mod transport;
pub mod triage;

pub use address::{AddressRange, RemoteAddress};
pub use config::DebuggerConfig;
pub use error::Error;
pub use native::{NativeEvent, NativeEventKind, NativePump};
pub use object::ObjectId;
pub use process::Process;
pub use target::DataAccess;
pub use transport::Transport;
pub use triage::unmanaged::EventId;

use crate::debugger::transport::message::IpcEvent;
use log::{debug, info};
use nix::unistd::Pid;
use std::sync::{mpsc, Arc};
use std::thread;

/// User callbacks. Called from the engine threads, never with the process lock held.
///
/// Managed and in-band callbacks run with the process synchronized, the callback is expected to
/// call [`Process::continue_debugee`] once, right away or later from any thread. Out-of-band
/// callbacks run on the native event thread while the whole debugee is frozen, the event is
/// resolved by `continue_debugee(true)`.
pub trait EventHook: Send + Sync {
    fn on_managed_event(&self, process: &Process, event: &IpcEvent) -> anyhow::Result<()>;

    fn on_native_event(
        &self,
        process: &Process,
        id: EventId,
        event: &NativeEvent,
        out_of_band: bool,
    ) -> anyhow::Result<()>;

    /// Called once when the process becomes unrecoverable.
    fn on_unrecoverable_error(&self, err: &Error);

    fn on_exit(&self, code: i32);
}

/// Attach to a debugee.
pub struct ProcessBuilder {
    hooks: Arc<dyn EventHook>,
    config: DebuggerConfig,
    pump: Option<Arc<dyn NativePump>>,
}

impl ProcessBuilder {
    pub fn new(hooks: Arc<dyn EventHook>) -> Self {
        Self {
            hooks,
            config: DebuggerConfig::default(),
            pump: None,
        }
    }

    pub fn with_config(self, config: DebuggerConfig) -> Self {
        Self { config, ..self }
    }

    /// Enable interop debugging: native events come from `pump`.
    pub fn with_native_pump(self, pump: Arc<dyn NativePump>) -> Self {
        Self {
            pump: Some(pump),
            ..self
        }
    }

    /// Create the process object. If the runtime is already loaded its protocol version is
    /// checked and runtime offsets are fetched.
    pub fn attach(
        self,
        pid: Pid,
        transport: Arc<dyn Transport>,
        data: Arc<dyn DataAccess>,
    ) -> Result<Arc<Process>, Error> {
        let pump = if self.config.interop { self.pump } else { None };
        let runtime_loaded = data.control_block()?.is_some();

        let process = Process::new(pid, self.config, transport, data, pump, self.hooks);
        if runtime_loaded {
            process.on_runtime_loaded()?;
        }
        info!(
            target: "stopgo",
            "attached to {pid}, runtime loaded: {runtime_loaded}"
        );
        Ok(Arc::new(process))
    }
}

/// Running engine: the dispatch thread and, in interop mode, the native event thread.
pub struct Session {
    process: Arc<Process>,
    dispatch: Option<thread::JoinHandle<()>>,
    pump: Option<thread::JoinHandle<()>>,
}

impl Session {
    pub fn start(process: Arc<Process>) -> Result<Self, Error> {
        let pump = match process.pump {
            Some(_) => {
                let (tx, rx) = mpsc::channel();
                process.set_pump_channel(tx);
                let p = process.clone();
                Some(
                    thread::Builder::new()
                        .name("oopdbg-pump".to_string())
                        .spawn(move || p.run_native_loop(rx))?,
                )
            }
            None => None,
        };

        let p = process.clone();
        let dispatch = thread::Builder::new()
            .name("oopdbg-dispatch".to_string())
            .spawn(move || p.run_dispatch_loop())?;

        Ok(Self {
            process,
            dispatch: Some(dispatch),
            pump,
        })
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Stop engine threads and wait for them.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.process.request_shutdown();
        for handle in [self.dispatch.take(), self.pump.take()].into_iter().flatten() {
            if handle.join().is_err() {
                log::error!(target: "dispatch", "engine thread panicked");
            }
        }
        debug!(target: "dispatch", "session for {} is over", self.process.pid());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.dispatch.is_some() || self.pump.is_some() {
            self.join();
        }
    }
}
