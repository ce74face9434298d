//! The chain arena: one slab of future/promise handshake slots per shard.
//!
//! A not-ready future does not point at its promise; both sides hold a
//! generation-tagged index into this arena instead, which removes the
//! back-pointer cycle and survives either endpoint moving. At any instant a
//! slot holds at most one half of the handshake; whichever side arrives
//! second completes it and the slot is freed exactly once.

use crate::error::Fault;
use slab::Slab;
use std::any::Any;

/// The value half of a handshake: the produced tuple, type-erased, or the
/// failure that replaced it.
pub(crate) type ChainValue = Result<Box<dyn Any>, Fault>;

/// An attached continuation, boxed at attach time. Attaching is the single
/// heap allocation of the handshake.
pub(crate) type Continuation = Box<dyn FnOnce(ChainValue)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChainHandle {
    index: usize,
    gen: u64,
}

enum SlotState {
    /// Both endpoints alive, neither has acted.
    Linked,
    /// The promise fulfilled before a continuation was attached.
    Fulfilled(ChainValue),
    /// A continuation was attached before fulfilment; the future is consumed.
    Captured(Continuation),
    /// The future was dropped without attaching.
    Abandoned,
}

struct Slot {
    gen: u64,
    state: SlotState,
}

/// What the caller must do after a state transition, performed outside the
/// arena so a continuation can re-enter it freely.
pub(crate) enum Ready {
    /// Schedule this continuation with this value on the ready-task queue.
    Schedule(Continuation, ChainValue),
    /// The outcome was discarded; a failure must be reported as ignored.
    Ignored(Fault),
    Nothing,
}

pub(crate) struct ChainArena {
    slots: Slab<Slot>,
    next_gen: u64,
}

impl ChainArena {
    pub(crate) fn new() -> Self {
        Self {
            slots: Slab::new(),
            next_gen: 1,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Creates the shared slot for a freshly linked (promise, future) pair.
    pub(crate) fn link(&mut self) -> ChainHandle {
        let gen = self.next_gen;
        self.next_gen += 1;
        let index = self.slots.insert(Slot {
            gen,
            state: SlotState::Linked,
        });
        ChainHandle { index, gen }
    }

    fn slot_mut(&mut self, h: ChainHandle) -> &mut Slot {
        let slot = self
            .slots
            .get_mut(h.index)
            .unwrap_or_else(|| panic!("FATAL: stale chain handle {:?}", h));
        if slot.gen != h.gen {
            panic!("FATAL: chain handle generation mismatch {:?}", h);
        }
        slot
    }

    /// Promise side delivering the outcome.
    pub(crate) fn fulfil(&mut self, h: ChainHandle, value: ChainValue) -> Ready {
        let slot = self.slot_mut(h);
        match std::mem::replace(&mut slot.state, SlotState::Linked) {
            SlotState::Linked => {
                slot.state = SlotState::Fulfilled(value);
                Ready::Nothing
            }
            SlotState::Captured(cont) => {
                self.slots.remove(h.index);
                Ready::Schedule(cont, value)
            }
            SlotState::Abandoned => {
                self.slots.remove(h.index);
                match value {
                    Err(fault) => Ready::Ignored(fault),
                    Ok(_) => Ready::Nothing,
                }
            }
            SlotState::Fulfilled(_) => panic!("FATAL: promise fulfilled twice"),
        }
    }

    /// Future side attaching its continuation; consumes the future.
    pub(crate) fn attach(&mut self, h: ChainHandle, cont: Continuation) -> Ready {
        let slot = self.slot_mut(h);
        match std::mem::replace(&mut slot.state, SlotState::Linked) {
            SlotState::Linked => {
                slot.state = SlotState::Captured(cont);
                Ready::Nothing
            }
            SlotState::Fulfilled(value) => {
                self.slots.remove(h.index);
                Ready::Schedule(cont, value)
            }
            SlotState::Captured(_) | SlotState::Abandoned => {
                panic!("FATAL: continuation attached to a consumed future")
            }
        }
    }

    /// The future was dropped while still pending.
    pub(crate) fn abandon_future(&mut self, h: ChainHandle) -> Ready {
        let slot = self.slot_mut(h);
        match std::mem::replace(&mut slot.state, SlotState::Linked) {
            SlotState::Linked => {
                slot.state = SlotState::Abandoned;
                Ready::Nothing
            }
            SlotState::Fulfilled(value) => {
                self.slots.remove(h.index);
                match value {
                    Err(fault) => Ready::Ignored(fault),
                    Ok(_) => Ready::Nothing,
                }
            }
            SlotState::Captured(_) | SlotState::Abandoned => {
                panic!("FATAL: pending future dropped twice")
            }
        }
    }

    /// The promise was dropped without fulfilling; the eventual consumer
    /// sees a broken-promise failure.
    pub(crate) fn abandon_promise(&mut self, h: ChainHandle, fault: Fault) -> Ready {
        let slot = self.slot_mut(h);
        match std::mem::replace(&mut slot.state, SlotState::Linked) {
            SlotState::Linked => {
                slot.state = SlotState::Fulfilled(Err(fault));
                Ready::Nothing
            }
            SlotState::Captured(cont) => {
                self.slots.remove(h.index);
                Ready::Schedule(cont, Err(fault))
            }
            SlotState::Abandoned => {
                self.slots.remove(h.index);
                Ready::Nothing
            }
            SlotState::Fulfilled(_) => panic!("FATAL: fulfilled promise reported as dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn boxed(v: i32) -> ChainValue {
        Ok(Box::new(v))
    }

    #[test]
    fn test_fulfil_then_attach_schedules() {
        let mut arena = ChainArena::new();
        let h = arena.link();
        assert!(matches!(arena.fulfil(h, boxed(7)), Ready::Nothing));
        match arena.attach(h, Box::new(|_| {})) {
            Ready::Schedule(_, Ok(v)) => assert_eq!(*v.downcast::<i32>().unwrap(), 7),
            _ => panic!("expected scheduled continuation"),
        }
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_attach_then_fulfil_schedules() {
        let mut arena = ChainArena::new();
        let h = arena.link();
        assert!(matches!(arena.attach(h, Box::new(|_| {})), Ready::Nothing));
        assert!(matches!(arena.fulfil(h, boxed(1)), Ready::Schedule(..)));
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_abandoned_future_reports_ignored_failure() {
        let mut arena = ChainArena::new();
        let h = arena.link();
        assert!(matches!(arena.abandon_future(h), Ready::Nothing));
        assert!(matches!(arena.fulfil(h, Err(anyhow!("lost"))), Ready::Ignored(_)));
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_dropped_promise_breaks_waiting_continuation() {
        let mut arena = ChainArena::new();
        let h = arena.link();
        arena.attach(h, Box::new(|_| {}));
        match arena.abandon_promise(h, anyhow!("broken promise")) {
            Ready::Schedule(_, Err(_)) => {}
            _ => panic!("expected broken-promise delivery"),
        }
        assert_eq!(arena.len(), 0);
    }

    #[test]
    #[should_panic(expected = "generation mismatch")]
    fn test_stale_generation_is_fatal() {
        let mut arena = ChainArena::new();
        let h1 = arena.link();
        arena.abandon_future(h1);
        arena.fulfil(h1, boxed(0));
        // The index is reused with a fresh generation; the old handle must
        // not alias it.
        let h2 = arena.link();
        assert_eq!(h1.index, h2.index, "slab should reuse the freed index");
        arena.fulfil(h1, boxed(0));
    }
}
