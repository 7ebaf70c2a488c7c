use deadstock_core::AggregateId;

/// A command targets a specific aggregate.
///
/// Commands represent **intent** - a request to perform an action on an
/// aggregate. They are transient (not persisted) and are transformed into
/// events. Commands are rejected if invalid; events represent accepted
/// changes.
///
/// Commands must own their data (`'static`) and be safe to move across
/// threads, so they can be queued, retried and logged.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
