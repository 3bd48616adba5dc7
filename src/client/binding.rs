
use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::time::Instant;

use crate::error::*;
use crate::proto::channum::{MAX_CHANNEL_NUMBER, MIN_CHANNEL_NUMBER};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BindingState {
    Requested,
    Ready,
    Refreshing,
    Failed,
}

/// A single channel binding: a (number, peer) pair and its refresh
/// bookkeeping.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct Binding {
    pub(crate) number: u16,
    pub(crate) st: BindingState,
    pub(crate) addr: SocketAddr,
    pub(crate) refreshed_at: Instant,
}

impl Binding {
    pub(crate) fn set_state(&mut self, state: BindingState) {
        self.st = state;
    }

    pub(crate) fn state(&self) -> BindingState {
        self.st
    }

    pub(crate) fn set_refreshed_at(&mut self, at: Instant) {
        self.refreshed_at = at;
    }

    pub(crate) fn refreshed_at(&self) -> Instant {
        self.refreshed_at
    }
}

/// Binding map of an allocation. Bindings live in one map keyed by
/// channel number; a peer-address side index answers the lookups the
/// write path and the demultiplexer need.
#[derive(Default)]
pub(crate) struct BindingManager {
    bindings: HashMap<u16, Binding>,
    numbers: HashMap<SocketAddr, u16>,
    next: u16,
}

impl BindingManager {
    pub(crate) fn new() -> Self {
        BindingManager {
            bindings: HashMap::new(),
            numbers: HashMap::new(),
            next: MIN_CHANNEL_NUMBER,
        }
    }

    /// Draws the next free channel number from the wrapping counter,
    /// skipping numbers that are still bound. Fails with
    /// `ErrNoChannelsFree` once every number in the range is in use.
    pub(crate) fn assign_channel_number(&mut self) -> Result<u16> {
        let span = (MAX_CHANNEL_NUMBER - MIN_CHANNEL_NUMBER) as usize + 1;
        for _ in 0..span {
            let n = self.next;
            self.next = if self.next == MAX_CHANNEL_NUMBER {
                MIN_CHANNEL_NUMBER
            } else {
                self.next + 1
            };
            if !self.bindings.contains_key(&n) {
                return Ok(n);
            }
        }
        Err(Error::ErrNoChannelsFree)
    }

    /// Creates a binding for `addr` in the `Requested` state.
    pub(crate) fn create(&mut self, addr: SocketAddr) -> Result<Binding> {
        let b = Binding {
            number: self.assign_channel_number()?,
            st: BindingState::Requested,
            addr,
            refreshed_at: Instant::now(),
        };

        self.numbers.insert(addr, b.number);
        self.bindings.insert(b.number, b);
        Ok(b)
    }

    pub(crate) fn find_by_addr(&self, addr: &SocketAddr) -> Option<&Binding> {
        self.numbers.get(addr).and_then(|n| self.bindings.get(n))
    }

    pub(crate) fn get_by_addr(&mut self, addr: &SocketAddr) -> Option<&mut Binding> {
        let number = *self.numbers.get(addr)?;
        self.bindings.get_mut(&number)
    }

    pub(crate) fn find_by_number(&self, number: u16) -> Option<&Binding> {
        self.bindings.get(&number)
    }

    pub(crate) fn delete_by_addr(&mut self, addr: &SocketAddr) -> bool {
        match self.numbers.remove(addr) {
            Some(number) => self.bindings.remove(&number).is_some(),
            None => false,
        }
    }

    pub(crate) fn delete_by_number(&mut self, number: u16) -> bool {
        match self.bindings.remove(&number) {
            Some(b) => self.numbers.remove(&b.addr).is_some(),
            None => false,
        }
    }

    /// Peers of every binding currently held, for the refresh pass.
    pub(crate) fn addrs(&self) -> Vec<SocketAddr> {
        self.numbers.keys().copied().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.bindings.clear();
        self.numbers.clear();
    }

    pub(crate) fn size(&self) -> usize {
        self.bindings.len()
    }
}
