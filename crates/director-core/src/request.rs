//! The request facade.
//!
//! The scheduling core never touches a concrete HTTP server type. It sees
//! requests through [`HttpExchange`], a narrow dyn-safe trait covering the
//! handful of operations scheduling needs: request-line accessors, the
//! response status slot, response header push/overwrite, a completion
//! signal, a post-to-worker hook, an abort-handler slot, and an opaque
//! custom-data map keyed by type identity. Embedders implement it once for
//! their request type.

use crate::HttpStatus;
use bytes::Bytes;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Closure type handed to [`HttpExchange::post`].
pub type WorkerTask = Box<dyn FnOnce() + Send + 'static>;

/// Closure type stored in the abort-handler slot.
pub type AbortHandler = Box<dyn FnOnce() + Send + 'static>;

/// The view of an in-flight HTTP request/response pair the director needs.
///
/// All methods take `&self`; implementations are expected to use interior
/// mutability and be cheap to call. Handles are shared as
/// `Arc<dyn HttpExchange>` between the cluster, the shaper queues, the
/// cache interest lists, and the transports.
pub trait HttpExchange: Send + Sync {
    fn method(&self) -> String;
    fn path(&self) -> String;
    fn query(&self) -> String;

    /// First value of the named request header, if present.
    fn request_header(&self, name: &str) -> Option<String>;

    /// Removes the named request header before the request goes upstream.
    fn remove_request_header(&self, name: &str);

    fn status(&self) -> Option<HttpStatus>;
    fn set_status(&self, status: HttpStatus);

    /// Appends a response header.
    fn push_header(&self, name: &str, value: &str);

    /// Replaces any existing values of the named response header.
    fn overwrite_header(&self, name: &str, value: &str);

    /// First value of the named response header, if present.
    fn response_header(&self, name: &str) -> Option<String>;

    /// Appends a chunk to the response body.
    fn write_body(&self, chunk: &[u8]);

    /// Completes the response. Must be called exactly once per request.
    fn finish(&self);

    fn is_finished(&self) -> bool;

    /// Hands a closure to the worker this request is pinned to.
    fn post(&self, task: WorkerTask);

    /// Installs the handler invoked when the client disconnects early.
    fn set_abort_handler(&self, handler: AbortHandler);

    /// The response as captured so far; used to seed the object cache when
    /// the origin's reply has fully streamed through.
    fn response_snapshot(&self) -> ResponseSnapshot;

    /// Per-request storage for components that need to attach state.
    fn custom_data(&self) -> &CustomDataMap;
}

/// An immutable capture of a complete upstream response.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    pub status: HttpStatus,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ResponseSnapshot {
    /// First value of the named header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A type-keyed map so multiple components can attach per-request state
/// without colliding.
#[derive(Default)]
pub struct CustomDataMap {
    slots: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl CustomDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under its type, replacing any previous value of the
    /// same type.
    pub fn set<T: Any + Send + Sync>(&self, value: Arc<T>) {
        self.slots
            .lock()
            .expect("custom data lock")
            .insert(TypeId::of::<T>(), value);
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.slots
            .lock()
            .expect("custom data lock")
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    pub fn remove<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.slots
            .lock()
            .expect("custom data lock")
            .remove(&TypeId::of::<T>())
            .and_then(|any| any.downcast::<T>().ok())
    }
}

impl std::fmt::Debug for CustomDataMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.slots.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("CustomDataMap").field("slots", &len).finish()
    }
}
