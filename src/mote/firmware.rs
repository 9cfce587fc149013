//! Firmware-backed motes.
//!
//! One mote type owns one communicator (one loaded native module) and the
//! initial memory image captured right after firmware init. Every mote of
//! the type keeps a private copy of that image; a tick swaps the mote's
//! image into the firmware memory section, runs the firmware quantum and
//! swaps it back out. That multiplexes any number of motes over a single
//! loaded module.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use anyhow::Context as _;

use crate::bridge::{BridgeError, Communicator, CommunicatorFactory, SlotId};
use crate::simulation::{MILLISECOND, SimTime};

use super::{MemoryAddressable, MoteAction, Tickable};

pub struct FirmwareMoteType {
    name: String,
    communicator: Rc<RefCell<Communicator>>,
    initial_image: Vec<u8>,
}

impl FirmwareMoteType {
    /// Allocate a fresh slot, build and load the adapter, run firmware init
    /// once and capture the initial memory image.
    pub fn create(
        factory: &mut CommunicatorFactory,
        name: &str,
        firmware: &Path,
    ) -> Result<Self, BridgeError> {
        let slot = factory.allocate_slot();
        let mut communicator = factory.bind(slot, firmware)?;
        communicator.init();
        let initial_image = communicator.get_memory(0, communicator.memory_size())?;
        log::info!(
            "mote type '{}' bound to {} ({} byte image)",
            name,
            slot,
            initial_image.len()
        );
        Ok(FirmwareMoteType {
            name: name.to_string(),
            communicator: Rc::new(RefCell::new(communicator)),
            initial_image,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self) -> SlotId {
        self.communicator.borrow().slot()
    }

    pub fn instantiate(&self) -> FirmwareMote {
        FirmwareMote {
            communicator: Rc::clone(&self.communicator),
            image: self.initial_image.clone(),
            tick_interval: MILLISECOND,
        }
    }
}

pub struct FirmwareMote {
    communicator: Rc<RefCell<Communicator>>,
    image: Vec<u8>,
    tick_interval: SimTime,
}

impl FirmwareMote {
    pub fn on_packet_received(&mut self, _payload: &[u8]) -> Vec<MoteAction> {
        // Delivery into firmware memory is left to the propagation policy
        // through the memory capability.
        Vec::new()
    }
}

impl Tickable for FirmwareMote {
    fn tick(&mut self, now: SimTime) -> anyhow::Result<Vec<MoteAction>> {
        let mut communicator = self.communicator.borrow_mut();
        communicator
            .set_memory(0, &self.image)
            .context("swapping mote memory in")?;
        communicator.tick();
        self.image = communicator
            .get_memory(0, self.image.len())
            .context("swapping mote memory out")?;
        Ok(vec![MoteAction::NextTick {
            at: now + self.tick_interval,
        }])
    }
}

impl MemoryAddressable for FirmwareMote {
    fn read_memory(&self, offset: usize, length: usize) -> anyhow::Result<Vec<u8>> {
        let end = image_range(offset, length, self.image.len())?;
        Ok(self.image[offset..end].to_vec())
    }

    fn write_memory(&mut self, offset: usize, data: &[u8]) -> anyhow::Result<()> {
        let end = image_range(offset, data.len(), self.image.len())?;
        self.image[offset..end].copy_from_slice(data);
        Ok(())
    }
}

fn image_range(offset: usize, length: usize, size: usize) -> Result<usize, BridgeError> {
    offset
        .checked_add(length)
        .filter(|end| *end <= size)
        .ok_or(BridgeError::Memory {
            offset,
            length,
            size,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_range_accepts_in_bounds_access() {
        assert_eq!(image_range(0, 16, 16).unwrap(), 16);
        assert_eq!(image_range(8, 4, 16).unwrap(), 12);
        assert_eq!(image_range(16, 0, 16).unwrap(), 16);
    }

    #[test]
    fn image_range_rejects_out_of_bounds_access() {
        assert!(matches!(
            image_range(8, 16, 16),
            Err(BridgeError::Memory { offset: 8, length: 16, size: 16 })
        ));
        // Offset + length overflow must not wrap into range.
        assert!(image_range(usize::MAX, 2, 16).is_err());
    }
}
