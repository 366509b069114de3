//! Handles of an event-driven backend driving a connection.
//!
//! A backend which owns the socket loop (a worker, the object it serves and an
//! event registration) can attach its handles to a
//! [`Connection`](crate::Connection) so that callbacks find their way back.
//! The connection only holds weak references and never keeps the backend
//! alive.

use std::{
    any::Any,
    fmt,
    sync::{Arc, Weak},
};

type Handle = Weak<dyn Any + Send + Sync>;

/// Non-owning references to backend objects.
#[derive(Clone, Default)]
pub struct BackendHandles {
    worker: Option<Handle>,
    object: Option<Handle>,
    event: Option<Handle>,
}

impl BackendHandles {
    /// Creates an empty set of handles.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker serving the connection.
    pub fn with_worker<T: Any + Send + Sync>(mut self, worker: &Arc<T>) -> Self {
        self.worker = Some(downgrade(worker));
        self
    }

    /// Sets the object associated with the connection.
    pub fn with_object<T: Any + Send + Sync>(mut self, object: &Arc<T>) -> Self {
        self.object = Some(downgrade(object));
        self
    }

    /// Sets the event registration of the connection.
    pub fn with_event<T: Any + Send + Sync>(mut self, event: &Arc<T>) -> Self {
        self.event = Some(downgrade(event));
        self
    }

    /// Returns the worker if it is still alive and of type `T`.
    pub fn worker<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        upgrade(&self.worker)
    }

    /// Returns the associated object if it is still alive and of type `T`.
    pub fn object<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        upgrade(&self.object)
    }

    /// Returns the event registration if it is still alive and of type `T`.
    pub fn event<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        upgrade(&self.event)
    }
}

fn downgrade<T: Any + Send + Sync>(handle: &Arc<T>) -> Handle {
    let handle: Arc<dyn Any + Send + Sync> = handle.clone();
    Arc::downgrade(&handle)
}

fn upgrade<T: Any + Send + Sync>(handle: &Option<Handle>) -> Option<Arc<T>> {
    handle.as_ref()?.upgrade()?.downcast().ok()
}

fn is_alive(handle: &Option<Handle>) -> bool {
    handle
        .as_ref()
        .is_some_and(|handle| handle.strong_count() > 0)
}

impl fmt::Debug for BackendHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandles")
            .field("worker", &is_alive(&self.worker))
            .field("object", &is_alive(&self.object))
            .field("event", &is_alive(&self.event))
            .finish()
    }
}
