use crate::client::{ClientError, TableService};
use crate::scope::ScopeTicket;
use std::collections::HashSet;
use zona_protocol::{ChangeKind, ChangeNotification, Event, EventId, Table};

/// What applying one change did to the local mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// A genuinely new event was prepended. The only outcome that should alert the user.
    Arrived,
    Replaced,
    Removed,
    /// Duplicate delivery, unknown id, or an undecodable row.
    Ignored,
    /// The change touched a table that is not mirrored incrementally.
    NeedsReload,
}

/// Local, newest-first mirror of the events table fed by a snapshot plus a change
/// stream. `seen_ids` always holds exactly the ids present in `events`.
#[derive(Debug, Clone, Default)]
pub struct EventStreamReconciler {
    events: Vec<Event>,
    seen_ids: HashSet<EventId>,
}

impl EventStreamReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn seen_ids(&self) -> &HashSet<EventId> {
        &self.seen_ids
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.seen_ids.contains(&id)
    }

    pub fn get(&self, id: EventId) -> Option<&Event> {
        self.events.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Replaces the mirror wholesale, keeping the order the service returned (newest
    /// first). Repeated ids keep their first row. Never reports an arrival.
    pub fn replace_snapshot(&mut self, mut events: Vec<Event>) {
        let mut seen = HashSet::with_capacity(events.len());
        events.retain(|e| seen.insert(e.id));
        self.seen_ids = seen;
        self.events = events;
    }

    /// Fetches the full table and replaces the mirror. A failed fetch leaves the mirror
    /// as it was; a fetch that outlives its view returns `Ok(None)` and changes nothing.
    pub async fn load_snapshot<S: TableService + ?Sized>(
        &mut self,
        service: &S,
        ticket: &ScopeTicket,
    ) -> Result<Option<usize>, ClientError> {
        let events = service.select_events().await?;
        if !ticket.is_live() {
            return Ok(None);
        }
        self.replace_snapshot(events);
        Ok(Some(self.events.len()))
    }

    pub fn apply_insert(&mut self, event: Event) -> Reconciled {
        if !self.seen_ids.insert(event.id) {
            tracing::trace!(id = event.id, "duplicate insert delivery");
            return Reconciled::Ignored;
        }
        self.events.insert(0, event);
        Reconciled::Arrived
    }

    pub fn apply_update(&mut self, event: Event) -> Reconciled {
        match self.events.iter_mut().find(|e| e.id == event.id) {
            Some(slot) => {
                *slot = event;
                Reconciled::Replaced
            }
            None => {
                tracing::trace!(id = event.id, "update for an event not mirrored yet");
                Reconciled::Ignored
            }
        }
    }

    pub fn apply_delete(&mut self, id: EventId) -> Reconciled {
        if !self.seen_ids.remove(&id) {
            return Reconciled::Ignored;
        }
        self.events.retain(|e| e.id != id);
        Reconciled::Removed
    }

    pub fn apply_change(&mut self, change: &ChangeNotification) -> Reconciled {
        if change.table != Table::Events {
            return Reconciled::NeedsReload;
        }
        match change.kind {
            ChangeKind::Insert => match decode(change) {
                Some(event) => self.apply_insert(event),
                None => Reconciled::Ignored,
            },
            ChangeKind::Update => match decode(change) {
                Some(event) => self.apply_update(event),
                None => Reconciled::Ignored,
            },
            ChangeKind::Delete => match change.old_id() {
                Some(id) => self.apply_delete(id),
                None => {
                    tracing::warn!(seq = change.seq, "delete notification without an id");
                    Reconciled::Ignored
                }
            },
        }
    }
}

fn decode(change: &ChangeNotification) -> Option<Event> {
    match change.new_record::<Event>() {
        Some(Ok(event)) => Some(event),
        Some(Err(err)) => {
            tracing::warn!(seq = change.seq, error = %err, "undecodable event row");
            None
        }
        None => {
            tracing::warn!(seq = change.seq, "event notification without a row");
            None
        }
    }
}
