use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Address in the debugee address space.
/// Never dereferenced locally, all access goes through [`crate::debugger::DataAccess`].
#[derive(
    Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RemoteAddress(u64);

impl RemoteAddress {
    pub const NULL: RemoteAddress = RemoteAddress(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, offset: isize) -> RemoteAddress {
        if offset >= 0 {
            self.0.wrapping_add(offset as u64)
        } else {
            self.0.wrapping_sub(offset.unsigned_abs() as u64)
        }
        .into()
    }

    pub fn add(self, n: u64) -> RemoteAddress {
        RemoteAddress(self.0.wrapping_add(n))
    }

    /// Distance in bytes from `base` to this address, `None` if this address lies below `base`.
    pub fn distance_from(self, base: RemoteAddress) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for RemoteAddress {
    fn from(addr: u64) -> Self {
        RemoteAddress(addr)
    }
}

impl From<usize> for RemoteAddress {
    fn from(addr: usize) -> Self {
        RemoteAddress(addr as u64)
    }
}

impl From<RemoteAddress> for u64 {
    fn from(addr: RemoteAddress) -> Self {
        addr.0
    }
}

impl Display for RemoteAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{:#016X}", self.0))
    }
}

/// Half-open range `[start, end)` of debugee addresses.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AddressRange {
    start: RemoteAddress,
    end: RemoteAddress,
}

impl AddressRange {
    /// Range of `len` bytes starting at `start`, end saturates at the top of address space.
    pub fn new(start: RemoteAddress, len: u64) -> Self {
        Self {
            start,
            end: RemoteAddress(start.0.saturating_add(len)),
        }
    }

    pub fn start(&self) -> RemoteAddress {
        self.start
    }

    pub fn end(&self) -> RemoteAddress {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end.0 - self.start.0
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: RemoteAddress) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn intersects(&self, other: &AddressRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl Display for AddressRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
