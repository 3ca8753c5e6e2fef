//! Two-party mutual exclusion
//!
//! Peterson's algorithm for exactly two fixed participants: the control
//! thread and the operator input thread. Each party announces intent on its
//! own flag and volunteers itself as the one to wait; it then spins while
//! the other party is interested and it is still the one volunteered.
//!
//! Not re-entrant, and each [`Party`] must be used from one thread at a
//! time. [`Console`](crate::console::Console) enforces that by handing out
//! exactly one handle per party.

use std::hint;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

/// Spins before the waiting party starts yielding its time slice
const SPINS_BEFORE_YIELD: u32 = 64;

/// The two participants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Control,
    Input,
}

impl Party {
    fn index(self) -> usize {
        match self {
            Party::Control => 0,
            Party::Input => 1,
        }
    }

    pub fn other(self) -> Party {
        match self {
            Party::Control => Party::Input,
            Party::Input => Party::Control,
        }
    }
}

#[derive(Debug)]
pub struct PetersonLock {
    interested: [AtomicBool; 2],
    /// The party that entered the protocol last and therefore yields
    waiting: AtomicUsize,
}

impl Default for PetersonLock {
    fn default() -> Self {
        Self::new()
    }
}

impl PetersonLock {
    pub const fn new() -> Self {
        Self {
            interested: [AtomicBool::new(false), AtomicBool::new(false)],
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self, party: Party) {
        let me = party.index();
        let other = party.other().index();

        // All accesses are SeqCst: the algorithm needs the store to our flag
        // to be ordered before the load of theirs.
        self.interested[me].store(true, Ordering::SeqCst);
        self.waiting.store(me, Ordering::SeqCst);

        let mut spins = 0u32;
        while self.interested[other].load(Ordering::SeqCst)
            && self.waiting.load(Ordering::SeqCst) == me
        {
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    pub fn release(&self, party: Party) {
        self.interested[party.index()].store(false, Ordering::SeqCst);
    }

    /// Acquire and release when the guard is dropped
    pub fn lock(&self, party: Party) -> PetersonGuard<'_> {
        self.acquire(party);
        PetersonGuard { lock: self, party }
    }
}

pub struct PetersonGuard<'a> {
    lock: &'a PetersonLock,
    party: Party,
}

impl Drop for PetersonGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.party);
    }
}
