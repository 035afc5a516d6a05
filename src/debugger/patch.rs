//! Shadow copy of the runtime breakpoint patch table.
//!
//! Runtime breakpoints replace instruction bytes in the debugee with a breakpoint instruction
//! and keep the original bytes in a patch record. The shadow table hides those breakpoints:
//! reads see original bytes, writes into patched ranges update the saved bytes while the
//! breakpoint stays in place.

use crate::debugger::address::{AddressRange, RemoteAddress};
use crate::debugger::error::Error;
use crate::debugger::runtime::PatchTableLayout;
use crate::debugger::target::{DataAccess, DataAccessExt};
use smallvec::SmallVec;

pub type Opcode = SmallVec<[u8; 8]>;

#[derive(Clone, Debug, PartialEq)]
pub struct PatchEntry {
    /// Patched instruction address.
    pub address: RemoteAddress,
    /// Original bytes hidden by the breakpoint instruction.
    pub opcode: Opcode,
    pub trace_type: u32,
    /// Placed by native debugging, not by the runtime.
    pub native: bool,
    /// Location of the patch record in debugee memory.
    record: RemoteAddress,
    next: Option<u32>,
}

impl PatchEntry {
    pub fn range(&self) -> AddressRange {
        AddressRange::new(self.address, self.opcode.len() as u64)
    }
}

/// Caller bytes destined for a patched range, committed after a successful write.
#[derive(Debug)]
pub struct Scratch {
    entry: u32,
    opcode: Opcode,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum TableState {
    NotLoaded,
    Loaded,
}

#[derive(Clone)]
pub struct PatchTable {
    state: TableState,
    entries: Vec<PatchEntry>,
    first: Option<u32>,
    bounds: Option<(RemoteAddress, RemoteAddress)>,
    breakpoint: &'static [u8],
    max_entries: u32,
}

impl PatchTable {
    pub fn new(breakpoint: &'static [u8], max_entries: u32) -> Self {
        Self {
            state: TableState::NotLoaded,
            entries: vec![],
            first: None,
            bounds: None,
            breakpoint,
            max_entries,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state == TableState::Loaded
    }

    /// Drop cached content, next access fetches the table again.
    pub fn invalidate(&mut self) {
        if self.is_loaded() {
            log::trace!(target: "patch", "invalidate patch table ({} entries)", self.entries.len());
        }
        self.state = TableState::NotLoaded;
        self.entries.clear();
        self.first = None;
        self.bounds = None;
    }

    /// Fetch the table from debugee memory. An unreadable table degrades to an empty one,
    /// a corrupted one is an error.
    pub fn refresh(
        &mut self,
        data: &dyn DataAccess,
        layout: Option<&PatchTableLayout>,
    ) -> Result<(), Error> {
        self.invalidate();

        let entries = match layout {
            None => vec![],
            Some(layout) => match self.fetch(data, layout) {
                Ok(entries) => entries,
                Err(e @ Error::TargetInconsistent(_)) => return Err(e),
                Err(e) => {
                    log::warn!(target: "patch", "patch table unreadable, assume no patches: {e:#}");
                    vec![]
                }
            },
        };
        self.install(entries);
        self.state = TableState::Loaded;
        Ok(())
    }

    fn fetch(
        &self,
        data: &dyn DataAccess,
        layout: &PatchTableLayout,
    ) -> Result<Vec<PatchEntry>, Error> {
        if layout.opcode_size < self.breakpoint.len() as u64 {
            return Err(Error::TargetInconsistent(format!(
                "patch opcode size {} smaller than breakpoint instruction",
                layout.opcode_size
            )));
        }

        if data.read_u32(layout.table_valid)? == 0 {
            return Err(Error::MemoryAccess(layout.table_valid, 4));
        }
        let header = RemoteAddress::from(data.read_u64(layout.table)?);
        if header.is_null() {
            return Ok(vec![]);
        }

        let entries_addr = RemoteAddress::from(data.read_u64(header.add(layout.off_entries))?);
        let count = data.read_u32(header.add(layout.off_count))?;
        if count > self.max_entries {
            return Err(Error::TargetInconsistent(format!(
                "patch table claims {count} entries"
            )));
        }
        if count == 0 {
            return Ok(vec![]);
        }
        if entries_addr.is_null() {
            return Err(Error::TargetInconsistent(
                "patch table without entries storage".into(),
            ));
        }

        let entry_size = layout.entry_size as usize;
        let mut raw = vec![0u8; entry_size * count as usize];
        data.read_memory(entries_addr, &mut raw)?;

        let mut entries = Vec::with_capacity(count as usize);
        for (idx, rec) in raw.chunks_exact(entry_size).enumerate() {
            let field = |off: u64, len: usize| &rec[off as usize..off as usize + len];

            let opcode = field(layout.off_opcode, layout.opcode_size as usize);
            if opcode.iter().all(|b| *b == 0) {
                // unused slot
                continue;
            }

            let mut addr = [0; 8];
            addr.copy_from_slice(field(layout.off_address, 8));
            let address = RemoteAddress::from(u64::from_le_bytes(addr));
            if address.is_null() {
                return Err(Error::TargetInconsistent(format!(
                    "patch entry {idx} has null address"
                )));
            }

            let mut trace = [0; 4];
            trace.copy_from_slice(field(layout.off_trace_type, 4));
            let trace_type = u32::from_le_bytes(trace);

            entries.push(PatchEntry {
                address,
                opcode: Opcode::from_slice(&opcode[..self.breakpoint.len()]),
                trace_type,
                native: trace_type == layout.trace_type_unmanaged,
                record: entries_addr.add((idx * entry_size) as u64),
                next: None,
            });
        }

        log::debug!(target: "patch", "fetched {} live patches of {count} slots", entries.len());
        Ok(entries)
    }

    fn install(&mut self, mut entries: Vec<PatchEntry>) {
        let len = entries.len() as u32;
        for (idx, entry) in entries.iter_mut().enumerate() {
            let next = idx as u32 + 1;
            entry.next = (next < len).then_some(next);
        }

        self.bounds = entries.iter().fold(None, |bounds, e| {
            let r = e.range();
            Some(match bounds {
                None => (r.start(), r.end()),
                Some((min, max)) => (min.min(r.start()), max.max(r.end())),
            })
        });
        self.first = (!entries.is_empty()).then_some(0);
        self.entries = entries;
    }

    /// Live entries in table order.
    pub fn iter(&self) -> impl Iterator<Item = &PatchEntry> {
        std::iter::successors(self.first.map(|i| &self.entries[i as usize]), |e| {
            e.next.map(|i| &self.entries[i as usize])
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Smallest range covering every live patch.
    pub fn bounds(&self) -> Option<AddressRange> {
        self.bounds.map(|(min, max)| {
            AddressRange::new(min, max.distance_from(min).unwrap_or_default())
        })
    }

    pub fn entry_at(&self, addr: RemoteAddress) -> Option<&PatchEntry> {
        if !self.bounds()?.contains(addr) {
            return None;
        }
        self.iter().find(|e| e.address == addr)
    }

    pub fn contains(&self, addr: RemoteAddress) -> bool {
        self.entry_at(addr).is_some()
    }

    /// True if a runtime placed patch lives at `addr`.
    pub fn is_runtime_patch(&self, addr: RemoteAddress) -> bool {
        self.entry_at(addr).map(|e| !e.native).unwrap_or(false)
    }

    fn intersecting(&self, region: AddressRange) -> impl Iterator<Item = (u32, &PatchEntry)> {
        let hit = self.bounds().map(|b| b.intersects(&region)).unwrap_or(false);
        let mut next = if hit { self.first } else { None };
        std::iter::from_fn(move || {
            while let Some(idx) = next {
                let entry = &self.entries[idx as usize];
                next = entry.next;
                if entry.range().intersects(&region) {
                    return Some((idx, entry));
                }
            }
            None
        })
    }

    /// Replace breakpoint bytes in `buf`, read from `addr`, with the original bytes.
    pub fn unapply(&self, addr: RemoteAddress, buf: &mut [u8]) {
        let region = AddressRange::new(addr, buf.len() as u64);
        for (_, entry) in self.intersecting(region) {
            for (i, byte) in entry.opcode.iter().enumerate() {
                let at = entry.address.add(i as u64);
                if let Some(pos) = at.distance_from(addr).filter(|_| region.contains(at)) {
                    buf[pos as usize] = *byte;
                }
            }
        }
    }

    /// Prepare `buf`, going to be written at `addr`, so that breakpoints stay in place.
    /// Returned scratch carries the caller bytes for patched ranges, pass it to
    /// [`PatchTable::commit`] once the write succeeds.
    pub fn apply_for_write(&self, addr: RemoteAddress, buf: &mut [u8]) -> Vec<Scratch> {
        let region = AddressRange::new(addr, buf.len() as u64);
        let breakpoint = self.breakpoint;
        self.intersecting(region)
            .map(|(idx, entry)| {
                let mut opcode = entry.opcode.clone();
                for (i, saved) in opcode.iter_mut().enumerate() {
                    let at = entry.address.add(i as u64);
                    if let Some(pos) = at.distance_from(addr).filter(|_| region.contains(at)) {
                        *saved = buf[pos as usize];
                        buf[pos as usize] = breakpoint[i];
                    }
                }
                Scratch { entry: idx, opcode }
            })
            .collect()
    }

    /// Store caller bytes as the new original bytes of patched ranges, both in the shadow table
    /// and in the debugee patch records.
    pub fn commit(
        &mut self,
        data: &dyn DataAccess,
        layout: Option<&PatchTableLayout>,
        scratch: &[Scratch],
    ) -> Result<(), Error> {
        if let Some(layout) = layout {
            for Scratch { entry, opcode } in scratch {
                let record = self.entries[*entry as usize].record;
                data.write_memory(record.add(layout.off_opcode), opcode)?;
            }
        }
        self.store(scratch);
        Ok(())
    }

    /// Shadow table part of [`PatchTable::commit`].
    pub fn store(&mut self, scratch: &[Scratch]) {
        for Scratch { entry, opcode } in scratch {
            if let Some(entry) = self.entries.get_mut(*entry as usize) {
                log::trace!(target: "patch", "new saved opcode at {}: {:02X?}", entry.address, opcode.as_slice());
                entry.opcode = opcode.clone();
            }
        }
    }

    /// Put original bytes of the patch at `addr` back into debugee code, used to step over it.
    pub fn lift(&self, data: &dyn DataAccess, addr: RemoteAddress) -> Result<bool, Error> {
        match self.entry_at(addr) {
            None => Ok(false),
            Some(entry) => {
                data.write_memory(addr, &entry.opcode)?;
                Ok(true)
            }
        }
    }

    /// Put breakpoint instruction back at `addr`.
    pub fn rearm(&self, data: &dyn DataAccess, addr: RemoteAddress) -> Result<(), Error> {
        data.write_memory(addr, self.breakpoint)
    }
}
