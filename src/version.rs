use crate::debugger::error::Error;
use crate::debugger::target::ControlBlock;
use std::fmt::{Display, Formatter};

/// Version of the control protocol spoken by one side of the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub current: u32,
    /// Oldest version of the opposite side this side can talk to.
    pub min_supported: u32,
}

impl ProtocolVersion {
    /// Protocol implemented by this crate.
    pub const CONTROLLER: ProtocolVersion = ProtocolVersion {
        current: 2,
        min_supported: 2,
    };

    /// Both sides must be at least as new as the other side requires.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.current >= other.min_supported && other.current >= self.min_supported
    }
}

impl From<&ControlBlock> for ProtocolVersion {
    fn from(block: &ControlBlock) -> Self {
        ProtocolVersion {
            current: block.protocol_current,
            min_supported: block.protocol_min_supported,
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (min {})", self.current, self.min_supported)
    }
}

/// Check that runtime published in `block` speaks a compatible protocol.
pub fn check(block: &ControlBlock) -> Result<(), Error> {
    let runtime = ProtocolVersion::from(block);
    let controller = ProtocolVersion::CONTROLLER;
    if controller.is_compatible_with(&runtime) {
        return Ok(());
    }
    Err(Error::ProtocolMismatch {
        runtime_current: runtime.current,
        runtime_min: runtime.min_supported,
        controller_current: controller.current,
        controller_min: controller.min_supported,
    })
}

/// Crate and protocol versions, for CLI output.
pub fn version_string() -> String {
    format!(
        "{} (protocol {})",
        env!("CARGO_PKG_VERSION"),
        ProtocolVersion::CONTROLLER
    )
}
