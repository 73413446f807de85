//! Client pollword handling. Clients register an interest mask and
//! receive a shared word; `update` ORs each change mask into every word
//! whose interest intersects it, and clients spin on their word.

use crate::err::{Error, Result};
use bitflags::bitflags;
use log::debug;
use std::cell::Cell;
use std::rc::Rc;

bitflags! {
    /// Mask of changes that clients can register an interest in.
    pub struct ChangeMask: u32 {
        /// The state of the remote link has changed.
        const LINK_STATE = 1 << 0;
        /// The state of an asynchronous operation has changed.
        const ASYNC_STATE = 1 << 1;
        /// An asynchronous operation has finished.
        const ASYNC_END = 1 << 2;
        /// The connected drive set has changed.
        const DRIVE_STATE = 1 << 3;
        /// The cache contents have changed.
        const CACHE_STATE = 1 << 4;
    }
}

/// A word shared with one registered client.
pub type PollwordCell = Rc<Cell<u32>>;

struct Registration {
    name: String,
    mask: ChangeMask,
    cell: PollwordCell,
}

/// The process-wide registry of pollwords.
pub struct PollwordBus {
    clients: Vec<Registration>,
}

impl PollwordBus {
    pub fn new() -> PollwordBus {
        PollwordBus {
            clients: Vec::new(),
        }
    }

    /// Register a client to be informed of changes. The returned cell is
    /// cleared initially; the client owns clearing it after handling a
    /// notification.
    pub fn register(&mut self, name: &str, mask: ChangeMask) -> PollwordCell {
        debug!("pollword register name='{}' mask={:?}", name, mask);
        let cell: PollwordCell = Rc::new(Cell::new(0));
        self.clients.push(Registration {
            name: name.to_string(),
            mask,
            cell: cell.clone(),
        });
        cell
    }

    /// Unregister the specified client.
    pub fn unregister(&mut self, cell: &PollwordCell) -> Result<()> {
        let pos = self
            .clients
            .iter()
            .position(|c| Rc::ptr_eq(&c.cell, cell))
            .ok_or(Error::BadPollwordHandle)?;
        let removed = self.clients.remove(pos);
        debug!("pollword unregister name='{}'", removed.name);
        Ok(())
    }

    /// Update any pollwords affected by the specified mask.
    pub fn update(&mut self, mask: ChangeMask) {
        for client in &self.clients {
            if client.mask.intersects(mask) {
                client.cell.set(client.cell.get() | mask.bits());
            }
        }
    }

    /// Check that no clients remain registered before finalisation.
    pub fn pre_finalise(&self) -> Result<()> {
        if self.clients.is_empty() {
            Ok(())
        } else {
            Err(Error::ClientsRegistered)
        }
    }
}

impl Default for PollwordBus {
    fn default() -> PollwordBus {
        PollwordBus::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_respects_interest_masks() {
        let mut bus = PollwordBus::new();
        let a = bus.register("a", ChangeMask::ASYNC_STATE | ChangeMask::ASYNC_END);
        let b = bus.register("b", ChangeMask::LINK_STATE);

        bus.update(ChangeMask::ASYNC_STATE);
        assert_eq!(a.get(), ChangeMask::ASYNC_STATE.bits());
        assert_eq!(b.get(), 0);

        bus.update(ChangeMask::ASYNC_END | ChangeMask::LINK_STATE);
        assert_eq!(
            a.get(),
            (ChangeMask::ASYNC_STATE | ChangeMask::ASYNC_END).bits()
        );
        assert_eq!(b.get(), ChangeMask::LINK_STATE.bits());
    }

    #[test]
    fn finalise_requires_no_clients() {
        let mut bus = PollwordBus::new();
        let cell = bus.register("client", ChangeMask::LINK_STATE);
        assert_eq!(bus.pre_finalise(), Err(Error::ClientsRegistered));
        bus.unregister(&cell).unwrap();
        assert_eq!(bus.pre_finalise(), Ok(()));
    }

    #[test]
    fn unregister_unknown_cell_fails() {
        let mut bus = PollwordBus::new();
        let stray: PollwordCell = Rc::new(Cell::new(0));
        assert_eq!(bus.unregister(&stray), Err(Error::BadPollwordHandle));
    }
}
