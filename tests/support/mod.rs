//! Hand-rolled fakes shared by the integration tests: an in-memory
//! connection pool, a scriptable transport, and a fixed DNS resolver.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use http::StatusCode;
use httpcall::{
    Connection, ConnectionPool, Dns, Error, Request, Response, ResponseBody, Result, Route,
    Transport, TransportErrorKind,
};

/// Installs the test log subscriber, honoring `RUST_LOG`. Safe to call
/// from every test; only the first call in a binary wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct FixedDns(pub Vec<IpAddr>);

impl FixedDns {
    pub fn localhost() -> Arc<FixedDns> {
        Arc::new(FixedDns(vec!["127.0.0.1".parse().unwrap()]))
    }
}

impl Dns for FixedDns {
    fn lookup(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

pub struct FakeConnection {
    route: Route,
    pub closed: AtomicBool,
}

impl Connection for FakeConnection {
    fn route(&self) -> &Route {
        &self.route
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A pool that "dials" instantly, optionally refusing the first N attempts.
pub struct FakePool {
    fail_first: AtomicUsize,
    pub dial_count: AtomicUsize,
}

impl FakePool {
    pub fn new() -> Arc<FakePool> {
        Self::failing_first(0)
    }

    pub fn failing_first(failures: usize) -> Arc<FakePool> {
        Arc::new(FakePool {
            fail_first: AtomicUsize::new(failures),
            dial_count: AtomicUsize::new(0),
        })
    }
}

impl ConnectionPool for FakePool {
    fn connect(&self, route: &Route) -> Result<Arc<dyn Connection>> {
        self.dial_count.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            return Err(Error::transport(
                TransportErrorKind::Connect,
                false,
                route.address().host(),
                "connection refused",
            ));
        }
        Ok(Arc::new(FakeConnection {
            route: route.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn release(&self, _connection: Arc<dyn Connection>) {}
}

#[derive(Clone)]
pub struct Script {
    pub status: StatusCode,
    pub headers: Vec<(&'static str, String)>,
    pub body: &'static str,
}

impl Script {
    pub fn ok(body: &'static str) -> Script {
        Script {
            status: StatusCode::OK,
            headers: Vec::new(),
            body,
        }
    }

    pub fn status(status: StatusCode) -> Script {
        Script {
            status,
            headers: Vec::new(),
            body: "",
        }
    }

    pub fn redirect(status: StatusCode, location: &str) -> Script {
        Script {
            status,
            headers: vec![("location", location.to_owned())],
            body: "",
        }
    }
}

/// Answers each request by URL from a script table, recording every
/// request it sees.
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Vec<Script>>>,
    pub requests: Mutex<Vec<Request>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport {
            scripts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Queues `script` as the next answer for `url`. Repeated calls queue
    /// consecutive answers; the last one repeats.
    pub fn on(&self, url: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_owned())
            .or_default()
            .push(script);
    }

    pub fn request_log(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn exchange(&self, request: &Request, _connection: &dyn Connection) -> Result<Response> {
        self.requests.lock().unwrap().push(request.clone());
        let url = request.url().as_str().to_owned();
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts.get_mut(&url).ok_or_else(|| {
                Error::transport(TransportErrorKind::Other, true, url.clone(), "no script for url")
            })?;
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0].clone()
            }
        };

        let mut builder = Response::builder()
            .request(request.clone())
            .status(script.status);
        for (name, value) in &script.headers {
            builder = builder.header(name, value)?;
        }
        builder
            .body(ResponseBody::buffered(script.body))
            .build()
    }
}
