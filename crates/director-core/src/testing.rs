//! A mock [`HttpExchange`] for tests.
//!
//! `MockExchange` records everything the core does to a request so tests
//! can assert on status, headers, and body. Its `post` hook runs closures
//! inline on the calling thread, which keeps scheduling tests synchronous
//! and deterministic.

use crate::request::{AbortHandler, CustomDataMap, HttpExchange, ResponseSnapshot, WorkerTask};
use crate::HttpStatus;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub struct MockExchange {
    method: String,
    path: String,
    query: String,
    request_headers: Mutex<Vec<(String, String)>>,
    response_headers: Mutex<Vec<(String, String)>>,
    status: Mutex<Option<HttpStatus>>,
    body: Mutex<Vec<u8>>,
    finished: AtomicBool,
    abort_handler: Mutex<Option<AbortHandler>>,
    custom: CustomDataMap,
}

impl MockExchange {
    pub fn new(method: &str, path: &str, query: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: query.to_string(),
            request_headers: Mutex::new(Vec::new()),
            response_headers: Mutex::new(Vec::new()),
            status: Mutex::new(None),
            body: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            abort_handler: Mutex::new(None),
            custom: CustomDataMap::new(),
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new("GET", path, "")
    }

    pub fn with_request_header(self, name: &str, value: &str) -> Self {
        self.request_headers
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
        self
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status.lock().unwrap().map(|s| s.code())
    }

    pub fn body(&self) -> Vec<u8> {
        self.body.lock().unwrap().clone()
    }

    /// Simulates the client disconnecting: fires the installed abort handler.
    pub fn client_abort(&self) {
        if let Some(handler) = self.abort_handler.lock().unwrap().take() {
            handler();
        }
    }
}

impl HttpExchange for MockExchange {
    fn method(&self) -> String {
        self.method.clone()
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn query(&self) -> String {
        self.query.clone()
    }

    fn request_header(&self, name: &str) -> Option<String> {
        self.request_headers
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    fn remove_request_header(&self, name: &str) {
        self.request_headers
            .lock()
            .unwrap()
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    fn status(&self) -> Option<HttpStatus> {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: HttpStatus) {
        *self.status.lock().unwrap() = Some(status);
    }

    fn push_header(&self, name: &str, value: &str) {
        self.response_headers
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
    }

    fn overwrite_header(&self, name: &str, value: &str) {
        let mut headers = self.response_headers.lock().unwrap();
        headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        headers.push((name.to_string(), value.to_string()));
    }

    fn response_header(&self, name: &str) -> Option<String> {
        self.response_headers
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    fn write_body(&self, chunk: &[u8]) {
        self.body.lock().unwrap().extend_from_slice(chunk);
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn post(&self, task: WorkerTask) {
        task();
    }

    fn set_abort_handler(&self, handler: AbortHandler) {
        *self.abort_handler.lock().unwrap() = Some(handler);
    }

    fn response_snapshot(&self) -> ResponseSnapshot {
        ResponseSnapshot {
            status: self.status().unwrap_or(HttpStatus::OK),
            headers: self.response_headers.lock().unwrap().clone(),
            body: Bytes::from(self.body()),
        }
    }

    fn custom_data(&self) -> &CustomDataMap {
        &self.custom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_response_state() {
        let ex = MockExchange::get("/a");
        ex.set_status(HttpStatus::OK);
        ex.push_header("X-Test", "1");
        ex.write_body(b"hello");
        ex.finish();

        assert!(ex.is_finished());
        assert_eq!(ex.status_code(), Some(200));
        assert_eq!(ex.response_header("x-test").as_deref(), Some("1"));
        assert_eq!(ex.body(), b"hello");
    }

    #[test]
    fn abort_handler_fires_once() {
        let ex = MockExchange::get("/a");
        let fired = std::sync::Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        ex.set_abort_handler(Box::new(move || f.store(true, Ordering::SeqCst)));
        ex.client_abort();
        ex.client_abort();
        assert!(fired.load(Ordering::SeqCst));
    }
}
