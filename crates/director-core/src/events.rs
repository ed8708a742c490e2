//! Event system for director components.
//!
//! A unified listener mechanism the cluster, monitor, and cache use to
//! surface state changes without coupling to any logging or metrics sink.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Trait for events emitted by director components.
pub trait DirectorEvent: Send + Sync + fmt::Debug {
    /// Returns the type of event (e.g. "request_dropped", "health_changed").
    fn event_type(&self) -> &'static str;

    /// Returns when this event occurred.
    fn timestamp(&self) -> Instant;

    /// Returns the name of the cluster (or component instance) that emitted it.
    fn cluster_name(&self) -> &str;
}

/// Trait for listening to director events.
pub trait EventListener<E: DirectorEvent>: Send + Sync {
    fn on_event(&self, event: &E);
}

/// A collection of event listeners.
#[derive(Clone)]
pub struct EventListeners<E: DirectorEvent> {
    listeners: Vec<Arc<dyn EventListener<E>>>,
}

impl<E: DirectorEvent> EventListeners<E> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Emits an event to all registered listeners.
    ///
    /// A panicking listener does not prevent the remaining listeners from
    /// being called.
    pub fn emit(&self, event: &E) {
        for listener in &self.listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));

            if result.is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    cluster = event.cluster_name(),
                    event_type = event.event_type(),
                    "director event listener panicked"
                );

                #[cfg(feature = "metrics")]
                metrics::counter!(
                    "director_event_listener_panics_total",
                    "event_type" => event.event_type()
                )
                .increment(1);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: DirectorEvent> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A simple function-based event listener.
pub struct FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    f: F,
    _phantom: std::marker::PhantomData<E>,
}

impl<E, F> FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<E, F> EventListener<E> for FnListener<E, F>
where
    E: DirectorEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}
