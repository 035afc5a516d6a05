use crate::debugger::address::RemoteAddress;
use crate::debugger::transport::message::IpcEventType;
use nix::unistd::Pid;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("config parsing error: {0}")]
    Config(#[from] toml::de::Error),

    // --------------------------------- synchronization errors ------------------------------------
    #[error("wait timed out after {0:?}")]
    Timeout(Duration),
    #[error("superfluous continue, process is not stopped")]
    SuperfluousContinue,
    #[error("blocking stop requested from the event dispatch thread")]
    StopOnDispatchThread,
    #[error("operation requires a synchronized process")]
    NotSynchronized,
    #[error("no out-of-band event awaits continuation")]
    NoOutOfBandEvent,
    #[error("out-of-band event is still unresolved")]
    OutOfBandPending,
    #[error("in-band continue issued from out-of-band callback")]
    InBandContinueFromOutOfBand,

    // --------------------------------- debugee process errors ------------------------------------
    #[error("debugee process terminated")]
    ProcessTerminated,
    #[error("debugger detached from the process")]
    Detached,
    #[error("process is in unrecoverable state: {0}")]
    Unrecoverable(String),
    #[error("debugee runtime is not loaded")]
    RuntimeNotLoaded,

    // --------------------------------- protocol errors -------------------------------------------
    #[error(
        "protocol version mismatch: runtime {runtime_current} (min {runtime_min}), \
        controller {controller_current} (min {controller_min})"
    )]
    ProtocolMismatch {
        runtime_current: u32,
        runtime_min: u32,
        controller_current: u32,
        controller_min: u32,
    },
    #[error("malformed ipc event: {0}")]
    MalformedEvent(&'static str),
    #[error("unknown ipc event type {0:#06x}")]
    UnknownEventType(u16),
    #[error("ipc event of {0} bytes exceeds transport buffer")]
    EventTooLarge(usize),
    #[error("unexpected reply {got}, expected {expected}")]
    UnexpectedReply {
        got: IpcEventType,
        expected: IpcEventType,
    },
    #[error("runtime failed {reply} with status {status}")]
    ReplyStatus { reply: IpcEventType, status: i32 },
    #[error("debugee helper thread is dead")]
    HelperThreadDead,
    #[error("transport: {0}")]
    Transport(String),

    // --------------------------------- remote memory errors --------------------------------------
    #[error("memory access at {0} ({1} bytes) failed")]
    MemoryAccess(RemoteAddress, usize),
    #[error("target inconsistent: {0}")]
    TargetInconsistent(String),

    // --------------------------------- native event errors ---------------------------------------
    #[error("thread {0} not found")]
    ThreadNotFound(Pid),
    #[error("thread {0} already hijacked")]
    AlreadyHijacked(Pid),
    #[error("thread {0} is not hijacked")]
    NotHijacked(Pid),
    #[error("exception of event {0} can not be cleared")]
    Unclearable(u64),
    #[error("native event {0} not found")]
    EventNotFound(u64),
    #[error("native pump: {0}")]
    NativePump(String),
    #[error("native pump thread is gone")]
    PumpDisconnected,
    #[error("interop debugging is not enabled")]
    NoInterop,

    // --------------------------------- resource errors -------------------------------------------
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("object #{0} is neutered")]
    ObjectNeutered(u32),

    // --------------------------------- third party errors ----------------------------------------
    #[error("hook: {0}")]
    Hook(anyhow::Error),
}

impl Error {
    /// Return a hint to a controller - continue debugging after error or give up the whole
    /// process. Fatal errors flip the process into unrecoverable state.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::Config(_) => false,
            Error::Timeout(_) => false,
            Error::SuperfluousContinue => false,
            Error::StopOnDispatchThread => false,
            Error::NotSynchronized => false,
            Error::NoOutOfBandEvent => false,
            Error::OutOfBandPending => false,
            Error::InBandContinueFromOutOfBand => false,
            Error::ProcessTerminated => false,
            Error::Detached => false,
            Error::Unrecoverable(_) => false,
            Error::RuntimeNotLoaded => false,
            Error::UnexpectedReply { .. } => false,
            Error::ReplyStatus { .. } => false,
            Error::MemoryAccess(_, _) => false,
            Error::TargetInconsistent(_) => false,
            Error::ThreadNotFound(_) => false,
            Error::AlreadyHijacked(_) => false,
            Error::NotHijacked(_) => false,
            Error::Unclearable(_) => false,
            Error::EventNotFound(_) => false,
            Error::NoInterop => false,
            Error::ResourceExhausted(_) => false,
            Error::ObjectNeutered(_) => false,
            Error::Hook(_) => false,

            // protocol corruption, debugee can't be trusted anymore
            Error::ProtocolMismatch { .. } => true,
            Error::MalformedEvent(_) => true,
            Error::UnknownEventType(_) => true,
            Error::EventTooLarge(_) => true,
            Error::HelperThreadDead => true,
            Error::Transport(_) => true,
            Error::NativePump(_) => true,
            Error::PumpDisconnected => true,
        }
    }

    /// True if a caller may simply retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "oopdbg", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "oopdbg", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
