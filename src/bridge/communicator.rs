//! Handle to one loaded firmware module.
//!
//! The library is leaked on load (INTENTIONAL LEAK: native modules cannot be
//! unloaded once loaded, the slot lease is permanent). All memory access goes
//! through offsets relative to the firmware's memory section; the absolute
//! load address never leaves this module.

use std::path::Path;

use libloading::{Library, Symbol};

use super::{BridgeError, SlotId};

type InitFn = unsafe extern "C" fn();
type TickFn = unsafe extern "C" fn();
type SizeFn = unsafe extern "C" fn() -> u64;
type RefAddrFn = unsafe extern "C" fn() -> u64;
type GetMemoryFn = unsafe extern "C" fn(u64, u64, *mut u8);
type SetMemoryFn = unsafe extern "C" fn(u64, u64, *const u8);

pub struct Communicator {
    slot: SlotId,
    init_fn: Symbol<'static, InitFn>,
    tick_fn: Symbol<'static, TickFn>,
    get_memory_fn: Symbol<'static, GetMemoryFn>,
    set_memory_fn: Symbol<'static, SetMemoryFn>,
    base_address: u64,
    memory_size: usize,
    init_done: bool,
}

impl Communicator {
    pub(super) fn load(slot: SlotId, module: &Path) -> Result<Self, BridgeError> {
        let library = unsafe { Library::new(module) }.map_err(|source| BridgeError::Load {
            path: module.to_path_buf(),
            source,
        })?;
        let library: &'static Library = Box::leak(Box::new(library));

        let init_fn = lookup::<InitFn>(library, &format!("sim_init_{}", slot.index()))?;
        let tick_fn = lookup::<TickFn>(library, &format!("sim_tick_{}", slot.index()))?;
        let size_fn = lookup::<SizeFn>(library, &format!("sim_memory_size_{}", slot.index()))?;
        let ref_addr_fn = lookup::<RefAddrFn>(library, &format!("sim_ref_addr_{}", slot.index()))?;
        let get_memory_fn =
            lookup::<GetMemoryFn>(library, &format!("sim_get_memory_{}", slot.index()))?;
        let set_memory_fn =
            lookup::<SetMemoryFn>(library, &format!("sim_set_memory_{}", slot.index()))?;

        let memory_size = unsafe { size_fn() } as usize;
        let base_address = unsafe { ref_addr_fn() };
        log::info!(
            "{} loaded from {} ({} bytes of firmware memory)",
            slot,
            module.display(),
            memory_size
        );

        Ok(Communicator {
            slot,
            init_fn,
            tick_fn,
            get_memory_fn,
            set_memory_fn,
            base_address,
            memory_size,
            init_done: false,
        })
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn memory_size(&self) -> usize {
        self.memory_size
    }

    /// One-time firmware startup. Later calls are no-ops.
    pub fn init(&mut self) {
        if self.init_done {
            return;
        }
        unsafe { (self.init_fn)() };
        self.init_done = true;
        log::debug!("{} initialized at base {:#x}", self.slot, self.base_address);
    }

    /// Advance the firmware by one scheduling quantum. Kernel thread only.
    pub fn tick(&mut self) {
        unsafe { (self.tick_fn)() };
    }

    pub fn get_memory(&self, offset: usize, length: usize) -> Result<Vec<u8>, BridgeError> {
        self.check_range(offset, length)?;
        let mut buffer = vec![0u8; length];
        unsafe { (self.get_memory_fn)(offset as u64, length as u64, buffer.as_mut_ptr()) };
        Ok(buffer)
    }

    pub fn set_memory(&mut self, offset: usize, data: &[u8]) -> Result<(), BridgeError> {
        self.check_range(offset, data.len())?;
        unsafe { (self.set_memory_fn)(offset as u64, data.len() as u64, data.as_ptr()) };
        Ok(())
    }

    fn check_range(&self, offset: usize, length: usize) -> Result<(), BridgeError> {
        let end = offset.checked_add(length);
        match end {
            Some(end) if end <= self.memory_size => Ok(()),
            _ => Err(BridgeError::Memory {
                offset,
                length,
                size: self.memory_size,
            }),
        }
    }
}

fn lookup<T>(library: &'static Library, name: &str) -> Result<Symbol<'static, T>, BridgeError> {
    unsafe { library.get(name.as_bytes()) }.map_err(|source| BridgeError::Symbol {
        symbol: name.to_string(),
        source,
    })
}
