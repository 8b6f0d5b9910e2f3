use retail_core::AggregateId;

/// A command targets exactly one aggregate (command abstraction).
///
/// Commands are intent ("ship order 42"); events are facts ("order 42 shipped").
/// A command is either rejected with a typed error or turned into events.
///
/// `target_aggregate_id()` lets orchestration code route a command to the
/// stream it must load, which keeps every call scoped to one consistency
/// boundary.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
