//! Runtime offsets: addresses of hijack stubs, flares and the patch table layout published by
//! the debugee runtime. Fetched once when runtime is loaded.

use crate::debugger::address::RemoteAddress;
use crate::debugger::error::Error;
use crate::debugger::target::DataAccess;
use strum_macros::Display;

/// Layout version of [`RuntimeOffsets`] understood by this crate.
pub const RUNTIME_OFFSETS_VERSION: u64 = 1;

const WORDS: usize = 18;
/// Size of the offsets structure in debugee memory.
pub const RUNTIME_OFFSETS_SIZE: usize = WORDS * 8;

/// Well known breakpoint instruction in runtime code, hit on purpose to talk to the debugger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Flare {
    SyncComplete,
    HijackStarted,
    HandoffStarted,
    HandoffComplete,
    HijackComplete,
    NotForRuntime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct Flares {
    pub sync_complete: RemoteAddress,
    pub hijack_started: RemoteAddress,
    pub handoff_started: RemoteAddress,
    pub handoff_complete: RemoteAddress,
    pub hijack_complete: RemoteAddress,
    pub not_for_runtime: RemoteAddress,
}

impl Flares {
    fn all(&self) -> [(Flare, RemoteAddress); 6] {
        [
            (Flare::SyncComplete, self.sync_complete),
            (Flare::HijackStarted, self.hijack_started),
            (Flare::HandoffStarted, self.handoff_started),
            (Flare::HandoffComplete, self.handoff_complete),
            (Flare::HijackComplete, self.hijack_complete),
            (Flare::NotForRuntime, self.not_for_runtime),
        ]
    }

    /// Flare located at `addr`, if any.
    pub fn find(&self, addr: RemoteAddress) -> Option<Flare> {
        self.all()
            .into_iter()
            .find_map(|(flare, flare_addr)| (flare_addr == addr).then_some(flare))
    }
}

/// Where the runtime keeps its breakpoint patch table and how the records look like.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchTableLayout {
    /// Address of a pointer to the table header.
    pub table: RemoteAddress,
    /// Address of a flag, non-zero while the table is consistent.
    pub table_valid: RemoteAddress,
    /// Offset of the entries pointer in the table header.
    pub off_entries: u64,
    /// Offset of the entry count in the table header.
    pub off_count: u64,
    /// Size of one entry.
    pub entry_size: u64,
    pub off_address: u64,
    pub off_opcode: u64,
    pub opcode_size: u64,
    pub off_trace_type: u64,
    /// Trace type of patches placed by native debugging, they are not runtime patches.
    pub trace_type_unmanaged: u32,
}

impl PatchTableLayout {
    /// Largest supported patch entry.
    pub const MAX_ENTRY_SIZE: u64 = 4096;
    /// Largest supported saved opcode.
    pub const MAX_OPCODE_SIZE: u64 = 8;

    fn validate(&self) -> Result<(), Error> {
        let fits = |offset: u64, size: u64| {
            offset
                .checked_add(size)
                .map(|end| end <= self.entry_size)
                .unwrap_or(false)
        };

        if self.entry_size == 0 || self.entry_size > Self::MAX_ENTRY_SIZE {
            return Err(Error::TargetInconsistent(format!(
                "patch entry size {} out of range",
                self.entry_size
            )));
        }
        if self.opcode_size == 0 || self.opcode_size > Self::MAX_OPCODE_SIZE {
            return Err(Error::TargetInconsistent(format!(
                "patch opcode size {} out of range",
                self.opcode_size
            )));
        }
        if !fits(self.off_address, 8)
            || !fits(self.off_opcode, self.opcode_size)
            || !fits(self.off_trace_type, 4)
        {
            return Err(Error::TargetInconsistent(
                "patch entry fields overflow entry".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeOffsets {
    pub version: u64,
    /// Stub that parks a hijacked thread until the debugger releases it.
    pub generic_hijack: RemoteAddress,
    pub flares: Flares,
    pub patch_table: PatchTableLayout,
}

impl RuntimeOffsets {
    /// Read and validate offsets located at `at` in debugee memory.
    pub fn fetch(data: &dyn DataAccess, at: RemoteAddress) -> Result<Self, Error> {
        let mut raw = [0u8; RUNTIME_OFFSETS_SIZE];
        data.read_memory(at, &mut raw)?;
        let offsets = Self::from_bytes(&raw);
        offsets.validate()?;
        Ok(offsets)
    }

    fn from_bytes(raw: &[u8; RUNTIME_OFFSETS_SIZE]) -> Self {
        let mut words = [0u64; WORDS];
        raw.chunks_exact(8).zip(words.iter_mut()).for_each(|(c, w)| {
            let mut b = [0; 8];
            b.copy_from_slice(c);
            *w = u64::from_le_bytes(b);
        });
        let addr = |i: usize| RemoteAddress::from(words[i]);

        RuntimeOffsets {
            version: words[0],
            generic_hijack: addr(1),
            flares: Flares {
                hijack_started: addr(2),
                handoff_started: addr(3),
                handoff_complete: addr(4),
                hijack_complete: addr(5),
                not_for_runtime: addr(6),
                sync_complete: addr(7),
            },
            patch_table: PatchTableLayout {
                table: addr(8),
                table_valid: addr(9),
                off_entries: words[10],
                off_count: words[11],
                entry_size: words[12],
                off_address: words[13],
                off_opcode: words[14],
                opcode_size: words[15],
                off_trace_type: words[16],
                trace_type_unmanaged: words[17] as u32,
            },
        }
    }

    /// Debugee memory image of these offsets.
    pub fn to_bytes(&self) -> [u8; RUNTIME_OFFSETS_SIZE] {
        let f = &self.flares;
        let l = &self.patch_table;
        let words: [u64; WORDS] = [
            self.version,
            self.generic_hijack.as_u64(),
            f.hijack_started.as_u64(),
            f.handoff_started.as_u64(),
            f.handoff_complete.as_u64(),
            f.hijack_complete.as_u64(),
            f.not_for_runtime.as_u64(),
            f.sync_complete.as_u64(),
            l.table.as_u64(),
            l.table_valid.as_u64(),
            l.off_entries,
            l.off_count,
            l.entry_size,
            l.off_address,
            l.off_opcode,
            l.opcode_size,
            l.off_trace_type,
            l.trace_type_unmanaged as u64,
        ];

        let mut raw = [0u8; RUNTIME_OFFSETS_SIZE];
        raw.chunks_exact_mut(8)
            .zip(words)
            .for_each(|(c, w)| c.copy_from_slice(&w.to_le_bytes()));
        raw
    }

    fn validate(&self) -> Result<(), Error> {
        if self.version != RUNTIME_OFFSETS_VERSION {
            return Err(Error::ProtocolMismatch {
                runtime_current: self.version as u32,
                runtime_min: self.version as u32,
                controller_current: RUNTIME_OFFSETS_VERSION as u32,
                controller_min: RUNTIME_OFFSETS_VERSION as u32,
            });
        }
        if self.generic_hijack.is_null() {
            return Err(Error::TargetInconsistent("null generic hijack stub".into()));
        }

        let flares = self.flares.all();
        for (i, (flare, addr)) in flares.iter().enumerate() {
            if addr.is_null() {
                return Err(Error::TargetInconsistent(format!("null {flare} flare")));
            }
            if flares[i + 1..].iter().any(|(_, other)| other == addr) {
                return Err(Error::TargetInconsistent(format!(
                    "{flare} flare address {addr} is not unique"
                )));
            }
        }

        self.patch_table.validate()
    }

    /// Flare located at `addr`, if any.
    pub fn flare_at(&self, addr: RemoteAddress) -> Option<Flare> {
        self.flares.find(addr)
    }
}
