//! Stream id arena of one connection.
//!
//! Slots are indexed by stream id and grow lazily up to the configured capacity.
//! Released ids go on a LIFO free list, so a just-released id is the next one
//! handed out. Every reservation carries a ticket; late abandon notifications whose
//! ticket no longer matches the slot are ignored, which keeps a reused id from
//! being freed on behalf of its previous owner.
use tokio::sync::oneshot;

use crate::protocol::ResponseMessage;

use super::ConnectionError;

pub(crate) type ResponseSender = oneshot::Sender<Result<ResponseMessage, ConnectionError>>;

#[derive(Debug)]
enum Slot {
    Free,
    /// Handed out, frame not written yet.
    Reserved { ticket: u64 },
    AwaitingResponse { ticket: u64, tx: ResponseSender },
    /// Owner lost interest after sending; the response is dropped on arrival.
    Abandoned { ticket: u64 },
}

impl Slot {
    fn ticket(&self) -> Option<u64> {
        match self {
            Slot::Free => None,
            Slot::Reserved { ticket }
            | Slot::AwaitingResponse { ticket, .. }
            | Slot::Abandoned { ticket } => Some(*ticket),
        }
    }
}

/// What arrived on a stream id.
#[derive(Debug)]
pub(crate) enum Completion {
    Waiting(ResponseSender),
    Abandoned,
    /// Nothing was outstanding on that id.
    Unknown,
}

#[derive(Debug)]
pub(crate) struct StreamTable {
    slots: Vec<Slot>,
    free: Vec<i16>,
    capacity: usize,
    in_use: usize,
    next_ticket: u64,
}

impl StreamTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            in_use: 0,
            next_ticket: 0,
        }
    }

    /// Take a free id, or `None` when every id is in use.
    pub(crate) fn reserve(&mut self) -> Option<(i16, u64)> {
        let stream = match self.free.pop() {
            Some(stream) => stream,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot::Free);
                (self.slots.len() - 1) as i16
            }
            None => return None,
        };
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.slots[stream as usize] = Slot::Reserved { ticket };
        self.in_use += 1;
        Some((stream, ticket))
    }

    /// Register the waiter of a reserved id. Fails when the reservation is gone,
    /// i.e. the connection was closed in between.
    pub(crate) fn attach(&mut self, stream: i16, ticket: u64, tx: ResponseSender) -> bool {
        let Some(slot) = self.slots.get_mut(stream as usize) else {
            return false;
        };
        if !matches!(slot, Slot::Reserved { ticket: t } if *t == ticket) {
            return false;
        }
        *slot = Slot::AwaitingResponse { ticket, tx };
        true
    }

    /// Give up on `stream`. Unsent reservations are freed at once; sent ones stay
    /// taken until their response shows up. Returns whether the id was freed.
    pub(crate) fn abandon(&mut self, stream: i16, ticket: u64) -> bool {
        let Some(slot) = self.slots.get_mut(stream as usize) else {
            return false;
        };
        if slot.ticket() != Some(ticket) {
            return false;
        }
        if matches!(slot, Slot::Reserved { .. }) {
            self.free_slot(stream);
            return true;
        }
        if matches!(slot, Slot::AwaitingResponse { .. }) {
            *slot = Slot::Abandoned { ticket };
        }
        false
    }

    /// A response arrived on `stream`; the id is released.
    pub(crate) fn complete(&mut self, stream: i16) -> Completion {
        let Some(slot) = self.slots.get_mut(stream as usize) else {
            return Completion::Unknown;
        };
        match std::mem::replace(slot, Slot::Free) {
            Slot::AwaitingResponse { tx, .. } => {
                self.release(stream);
                Completion::Waiting(tx)
            }
            Slot::Abandoned { .. } => {
                self.release(stream);
                Completion::Abandoned
            }
            // A response to a frame that was never written is as unexpected as one
            // to a free id.
            other => {
                *slot = other;
                Completion::Unknown
            }
        }
    }

    /// Release every id at once, handing back the waiters that still expect an
    /// answer.
    pub(crate) fn drain(&mut self) -> Vec<ResponseSender> {
        let mut waiters = Vec::new();
        for stream in 0..self.slots.len() {
            match std::mem::replace(&mut self.slots[stream], Slot::Free) {
                Slot::Free => continue,
                Slot::AwaitingResponse { tx, .. } => waiters.push(tx),
                Slot::Reserved { .. } | Slot::Abandoned { .. } => {}
            }
            self.release(stream as i16);
        }
        waiters
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }

    pub(crate) fn available(&self) -> usize {
        self.capacity - self.in_use
    }

    fn free_slot(&mut self, stream: i16) {
        self.slots[stream as usize] = Slot::Free;
        self.release(stream);
    }

    fn release(&mut self, stream: i16) {
        self.in_use -= 1;
        self.free.push(stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter() -> (ResponseSender, oneshot::Receiver<Result<ResponseMessage, ConnectionError>>) {
        oneshot::channel()
    }

    #[test]
    fn released_id_is_reused_first() {
        let mut table = StreamTable::new(8);
        let (a, a_ticket) = table.reserve().unwrap();
        let (b, _) = table.reserve().unwrap();
        assert_ne!(a, b);

        assert!(table.abandon(a, a_ticket));
        assert_eq!(table.reserve().unwrap().0, a);
    }

    #[test]
    fn exhaustion_fails_instead_of_blocking() {
        let mut table = StreamTable::new(2);
        table.reserve().unwrap();
        table.reserve().unwrap();

        assert!(table.reserve().is_none());
        assert_eq!(table.available(), 0);
    }

    #[test]
    fn ids_are_never_double_assigned() {
        let mut table = StreamTable::new(64);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let (stream, _) = table.reserve().unwrap();
            assert!(seen.insert(stream));
        }
    }

    #[test]
    fn abandoned_after_send_is_freed_on_arrival() {
        let mut table = StreamTable::new(4);
        let (stream, ticket) = table.reserve().unwrap();
        let (tx, _rx) = waiter();
        assert!(table.attach(stream, ticket, tx));

        assert!(!table.abandon(stream, ticket));
        assert_eq!(table.in_use(), 1);

        assert!(matches!(table.complete(stream), Completion::Abandoned));
        assert_eq!(table.in_use(), 0);
    }

    #[test]
    fn stale_abandon_does_not_free_a_reused_id() {
        let mut table = StreamTable::new(1);
        let (stream, old) = table.reserve().unwrap();
        let (tx, _rx) = waiter();
        table.attach(stream, old, tx);
        assert!(matches!(table.complete(stream), Completion::Waiting(_)));

        let (reused, new) = table.reserve().unwrap();
        assert_eq!(reused, stream);
        assert!(!table.abandon(stream, old));
        assert_eq!(table.in_use(), 1);
        assert!(table.abandon(stream, new));
    }

    #[test]
    fn responses_to_unknown_or_unsent_ids() {
        let mut table = StreamTable::new(4);
        assert!(matches!(table.complete(3), Completion::Unknown));

        let (stream, _) = table.reserve().unwrap();
        assert!(matches!(table.complete(stream), Completion::Unknown));
        assert_eq!(table.in_use(), 1);
    }

    #[test]
    fn drain_releases_each_id_once() {
        let mut table = StreamTable::new(8);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (stream, ticket) = table.reserve().unwrap();
            let (tx, rx) = waiter();
            table.attach(stream, ticket, tx);
            receivers.push(rx);
        }
        let (unsent, unsent_ticket) = table.reserve().unwrap();

        assert_eq!(table.drain().len(), 3);
        assert_eq!(table.in_use(), 0);
        assert_eq!(table.available(), 8);

        assert!(!table.abandon(unsent, unsent_ticket));
        assert!(table.drain().is_empty());
        assert_eq!(table.in_use(), 0);
    }
}
