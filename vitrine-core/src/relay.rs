use vitrine_shared::ReservationEvent;

/// Outbound copy of every committed reservation event, used to reach watchers
/// connected to other instances.
///
/// Implementations must only enqueue: the manager calls this on the write path.
pub trait EventRelay: Send + Sync {
    fn relay(&self, event: &ReservationEvent);
}
