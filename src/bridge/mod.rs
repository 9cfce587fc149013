//! Native code bridge: runs compiled firmware inside the simulator process.
//!
//! A loaded native module can never be unloaded for the life of the process,
//! so every mote type consumes a fresh "communicator slot". The slot id is
//! baked into the generated adapter's exported symbol names, which keeps
//! several loaded modules from colliding. Slots are permanent leases:
//! deleting a mote type does not return its slot, and a new type always
//! gets a never-before-issued id.

pub mod build;
pub mod communicator;

pub use communicator::Communicator;

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("adapter build failed with exit code {code}: {diagnostics}")]
    Build { code: i32, diagnostics: String },
    #[error("failed to run build command '{command}': {source}")]
    BuildSpawn {
        command: String,
        source: std::io::Error,
    },
    #[error("failed to load native module {path}: {source}")]
    Load {
        path: PathBuf,
        source: libloading::Error,
    },
    #[error("native module is missing symbol {symbol}: {source}")]
    Symbol {
        symbol: String,
        source: libloading::Error,
    },
    #[error("memory access out of range: offset {offset} length {length}, section is {size} bytes")]
    Memory {
        offset: usize,
        length: usize,
        size: usize,
    },
    #[error("adapter workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}

/// Process-unique identifier of one communicator slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SlotId(u32);

impl SlotId {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

/// Allocates slots and turns firmware artifacts into live communicators.
///
/// Owned by the simulation; there is no process-global state. The monotonic
/// counter alone guarantees slot permanence within the factory's lifetime.
pub struct CommunicatorFactory {
    next_slot: u32,
    compiler: String,
    extra_cflags: Vec<String>,
}

impl CommunicatorFactory {
    pub fn new(compiler: impl Into<String>, extra_cflags: Vec<String>) -> Self {
        CommunicatorFactory {
            next_slot: 0,
            compiler: compiler.into(),
            extra_cflags,
        }
    }

    /// Issue a fresh slot. Never reuses an id, even if the slot is never
    /// bound or its mote type is later deleted.
    pub fn allocate_slot(&mut self) -> SlotId {
        let slot = SlotId(self.next_slot);
        self.next_slot += 1;
        log::debug!("allocated communicator {}", slot);
        slot
    }

    /// Generate the adapter for `slot`, compile it against the firmware
    /// artifact and load the resulting module.
    pub fn bind(&self, slot: SlotId, firmware: &Path) -> Result<Communicator, BridgeError> {
        let workspace = tempfile::Builder::new()
            .prefix(&format!("motesim-{slot}-"))
            .tempdir()?;
        // The module stays loaded forever, so the workspace is kept too.
        let workspace = workspace.keep();

        let source_path = workspace.join(format!("adapter_{}.c", slot.index()));
        std::fs::write(&source_path, build::generate_adapter_source(slot))?;

        let module_path = workspace.join(format!("adapter_{}.so", slot.index()));
        build::compile_adapter(
            &self.compiler,
            &self.extra_cflags,
            &source_path,
            firmware,
            &module_path,
        )?;

        Communicator::load(slot, &module_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_never_reused() {
        let mut factory = CommunicatorFactory::new("cc", Vec::new());
        let s1 = factory.allocate_slot();
        let s2 = factory.allocate_slot();
        let s3 = factory.allocate_slot();

        // The mote type owning s2 goes away; its slot stays consumed.
        drop(s2);
        let s4 = factory.allocate_slot();

        let ids = [s1.index(), s2.index(), s3.index(), s4.index()];
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(s4.index(), 3);
    }

    #[test]
    fn build_error_carries_diagnostics() {
        let err = BridgeError::Build {
            code: 1,
            diagnostics: "undefined reference to `firmware_tick'".into(),
        };
        let text = err.to_string();
        assert!(text.contains("exit code 1"));
        assert!(text.contains("firmware_tick"));
    }
}
