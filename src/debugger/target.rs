//! Out-of-process inspection of the debugee.

use crate::debugger::address::RemoteAddress;
use crate::debugger::error::Error;
use nix::unistd::Pid;

/// Classification of a debugee address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AddressKind {
    /// Code belonging to the managed runtime itself.
    RuntimeCode,
    RuntimeData,
    Unrecognized,
}

/// Per thread facts known by the runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteThreadInfo {
    /// Nesting depth of "can't stop" regions, thread can't be synchronized while it is positive.
    pub cant_stop: u32,
    /// Thread is a runtime housekeeping (helper) thread.
    pub is_helper: bool,
    /// Address of the thread exception handler chain head.
    pub handler_chain_slot: Option<RemoteAddress>,
}

impl RemoteThreadInfo {
    pub fn in_cant_stop_region(&self) -> bool {
        self.cant_stop > 0
    }
}

/// Runtime debugger control block, published by the runtime once it is loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlBlock {
    pub protocol_current: u32,
    pub protocol_min_supported: u32,
    /// Where [`crate::debugger::runtime::RuntimeOffsets`] lives in debugee memory.
    pub runtime_offsets: RemoteAddress,
}

/// Read/write access to debugee memory and runtime metadata.
pub trait DataAccess: Send + Sync {
    /// Fill `buf` with debugee memory starting at `addr`.
    fn read_memory(&self, addr: RemoteAddress, buf: &mut [u8]) -> Result<(), Error>;

    /// Write `data` into debugee memory starting at `addr`.
    fn write_memory(&self, addr: RemoteAddress, data: &[u8]) -> Result<(), Error>;

    fn classify_address(&self, addr: RemoteAddress) -> AddressKind;

    /// Runtime control block, `None` if runtime is not loaded yet.
    fn control_block(&self) -> Result<Option<ControlBlock>, Error>;

    fn thread_info(&self, tid: Pid) -> Result<RemoteThreadInfo, Error>;

    /// All native threads of the debugee.
    fn threads(&self) -> Result<Vec<Pid>, Error>;
}

/// Typed reads and writes over [`DataAccess`].
pub trait DataAccessExt {
    fn read_u32(&self, addr: RemoteAddress) -> Result<u32, Error>;
    fn read_u64(&self, addr: RemoteAddress) -> Result<u64, Error>;
    fn write_u64(&self, addr: RemoteAddress, value: u64) -> Result<(), Error>;
}

impl<T: DataAccess + ?Sized> DataAccessExt for T {
    fn read_u32(&self, addr: RemoteAddress) -> Result<u32, Error> {
        let mut buf = [0; 4];
        self.read_memory(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: RemoteAddress) -> Result<u64, Error> {
        let mut buf = [0; 8];
        self.read_memory(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&self, addr: RemoteAddress, value: u64) -> Result<(), Error> {
        self.write_memory(addr, &value.to_le_bytes())
    }
}
