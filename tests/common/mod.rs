//! Shared test harness: a scriptable backend transport and cluster
//! builders used across the scenario tests.

#![allow(dead_code)]

use director::{
    BackendSpec, BackendTransport, Cluster, HealthCheckPrototype, HealthState, HttpStatus,
    Protocol, SocketSpec, TransportFactory,
};
use director_core::testing::MockExchange;
use director_core::HttpExchange;
use director_health::{HealthProbe, ProbeError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// How a mock backend reacts to `process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Accept and park the request until the test completes or fails it.
    Hold,
    /// Accept and finish the request successfully, inline.
    CompleteOk,
    /// Refuse synchronously (`process` returns false).
    RefuseSync,
    /// Accept, then immediately report the upstream as failed.
    RejectAfterAccept,
}

/// Handle to one mock backend's transport.
pub struct BackendControl {
    cluster: Arc<Mutex<Option<Arc<Cluster>>>>,
    behavior: Mutex<Behavior>,
    processed: AtomicUsize,
    held: Mutex<VecDeque<Arc<dyn HttpExchange>>>,
}

impl BackendControl {
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Number of `process` invocations this backend has seen.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    fn cluster(&self) -> Arc<Cluster> {
        self.cluster
            .lock()
            .unwrap()
            .clone()
            .expect("factory not bound to a cluster")
    }

    /// Finishes the oldest held request successfully.
    pub fn complete_one(&self, status: u16, body: &[u8]) -> bool {
        self.complete_one_with(status, &[], body)
    }

    /// Finishes the oldest held request with extra response headers.
    pub fn complete_one_with(
        &self,
        status: u16,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> bool {
        let exchange = self.held.lock().unwrap().pop_front();
        match exchange {
            Some(exchange) => {
                exchange.set_status(HttpStatus(status));
                for (name, value) in headers {
                    exchange.push_header(name, value);
                }
                exchange.write_body(body);
                exchange.finish();
                self.cluster().release(&exchange);
                true
            }
            None => false,
        }
    }

    /// Fails the oldest held request at the transport level.
    pub fn fail_one(&self) -> bool {
        let exchange = self.held.lock().unwrap().pop_front();
        match exchange {
            Some(exchange) => {
                self.cluster().reject(&exchange, HttpStatus::BAD_GATEWAY);
                true
            }
            None => false,
        }
    }
}

struct MockTransport {
    control: Arc<BackendControl>,
}

impl BackendTransport for MockTransport {
    fn process(&self, exchange: &Arc<dyn HttpExchange>) -> bool {
        self.control.processed.fetch_add(1, Ordering::SeqCst);

        let behavior = *self.control.behavior.lock().unwrap();
        match behavior {
            Behavior::Hold => {
                self.control
                    .held
                    .lock()
                    .unwrap()
                    .push_back(Arc::clone(exchange));
                true
            }
            Behavior::CompleteOk => {
                exchange.set_status(HttpStatus::OK);
                exchange.write_body(b"upstream body");
                exchange.finish();
                self.control.cluster().release(exchange);
                true
            }
            Behavior::RefuseSync => false,
            Behavior::RejectAfterAccept => {
                self.control
                    .cluster()
                    .reject(exchange, HttpStatus::BAD_GATEWAY);
                true
            }
        }
    }
}

/// Factory producing scriptable transports, one control per backend name.
pub struct MockFactory {
    cluster: Arc<Mutex<Option<Arc<Cluster>>>>,
    controls: Mutex<HashMap<String, Arc<BackendControl>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cluster: Arc::new(Mutex::new(None)),
            controls: Mutex::new(HashMap::new()),
        })
    }

    /// Transports call back into the cluster, so the factory learns about
    /// it right after the build.
    pub fn bind(&self, cluster: &Arc<Cluster>) {
        *self.cluster.lock().unwrap() = Some(Arc::clone(cluster));
    }

    pub fn control(&self, backend: &str) -> Arc<BackendControl> {
        self.controls
            .lock()
            .unwrap()
            .get(backend)
            .cloned()
            .unwrap_or_else(|| panic!("no transport created for backend {backend:?}"))
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        spec: &BackendSpec,
        _health: &HealthCheckPrototype,
    ) -> (Arc<dyn BackendTransport>, Arc<dyn HealthProbe>) {
        let control = Arc::new(BackendControl {
            cluster: Arc::clone(&self.cluster),
            behavior: Mutex::new(Behavior::CompleteOk),
            processed: AtomicUsize::new(0),
            held: Mutex::new(VecDeque::new()),
        });
        self.controls
            .lock()
            .unwrap()
            .insert(spec.name.clone(), Arc::clone(&control));

        let transport = Arc::new(MockTransport { control });
        let probe = Arc::new(|| async { Ok::<u16, ProbeError>(200) }) as Arc<dyn HealthProbe>;
        (transport, probe)
    }
}

/// Builds a cluster, binds the factory, and returns both.
pub fn cluster_with(
    configure: impl FnOnce(director::ClusterBuilder) -> director::ClusterBuilder,
) -> (Arc<Cluster>, Arc<MockFactory>) {
    let factory = MockFactory::new();
    let builder = Cluster::builder("test-cluster", factory.clone() as Arc<dyn TransportFactory>);
    let cluster = Arc::new(configure(builder).build());
    factory.bind(&cluster);
    (cluster, factory)
}

/// Registers an HTTP backend and forces it online so admission is open.
pub fn online_backend(cluster: &Cluster, spec: BackendSpec) -> director::BackendId {
    let id = cluster.create_backend(spec).expect("backend created");
    let backend = cluster.backend(id).expect("backend exists");
    backend.monitor().set_state(HealthState::Online);
    id
}

pub fn http_spec(name: &str, port: u16) -> BackendSpec {
    BackendSpec::new(name, Protocol::Http, SocketSpec::inet("127.0.0.1", port))
}

pub fn get_request(path: &str) -> (Arc<MockExchange>, Arc<dyn HttpExchange>) {
    let mock = Arc::new(MockExchange::get(path));
    let exchange: Arc<dyn HttpExchange> = mock.clone();
    (mock, exchange)
}
