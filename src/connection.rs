use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Error, Result};
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::Response;
use crate::route::{Address, Route, RouteDatabase, RouteSelector};
use crate::util::lock_unpoisoned;

/// A live connection to a server. The pool owns the concrete type; the
/// engine only ever needs its route and a way to slam it shut on cancel.
pub trait Connection: Send + Sync {
    fn route(&self) -> &Route;
    /// Closes the underlying socket. Must be safe to call from any thread
    /// while another thread is mid-exchange.
    fn close(&self);
}

/// Supplies connections for routes. Pooling policy (reuse, keep-alive,
/// limits) lives entirely behind this trait.
pub trait ConnectionPool: Send + Sync {
    fn connect(&self, route: &Route) -> Result<Arc<dyn Connection>>;
    fn release(&self, connection: Arc<dyn Connection>);
}

/// The terminal exchange: writes one request over a connection and reads
/// one response. Wire formatting is an external collaborator.
pub trait Transport: Send + Sync {
    fn exchange(&self, request: &Request, connection: &dyn Connection) -> Result<Response>;
}

struct AllocationInner {
    selector: RouteSelector,
    connection: Option<Arc<dyn Connection>>,
    codec_in_use: bool,
    released: bool,
}

/// Per-call connection bookkeeping. Owns the route enumeration for the
/// call's current address, at most one live connection, and the flag that
/// says a response body is still draining through that connection.
pub struct Allocation {
    pool: Arc<dyn ConnectionPool>,
    route_database: Arc<RouteDatabase>,
    canceled: AtomicBool,
    inner: Mutex<AllocationInner>,
}

impl Allocation {
    pub(crate) fn new(
        address: Arc<Address>,
        route_database: Arc<RouteDatabase>,
        pool: Arc<dyn ConnectionPool>,
    ) -> Self {
        let selector = RouteSelector::new(address, Arc::clone(&route_database));
        Self {
            pool,
            route_database,
            canceled: AtomicBool::new(false),
            inner: Mutex::new(AllocationInner {
                selector,
                connection: None,
                codec_in_use: false,
                released: false,
            }),
        }
    }

    /// Returns the live connection, dialing one route candidate if none is
    /// held. A connect failure consumes exactly one candidate; the retry
    /// stage decides whether to come back for the next one.
    pub(crate) fn find_connection(&self) -> Result<Arc<dyn Connection>> {
        if self.is_canceled() {
            return Err(Error::Canceled);
        }
        let route = {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.released {
                return Err(Error::Canceled);
            }
            if let Some(connection) = &inner.connection {
                return Ok(Arc::clone(connection));
            }
            inner.selector.next()?
        };

        // Dial without holding the lock so cancel() stays responsive.
        match self.pool.connect(&route) {
            Ok(connection) => {
                self.route_database.connected(&route);
                if self.is_canceled() {
                    connection.close();
                    self.pool.release(connection);
                    return Err(Error::Canceled);
                }
                let mut inner = lock_unpoisoned(&self.inner);
                inner.connection = Some(Arc::clone(&connection));
                Ok(connection)
            }
            Err(error) => {
                debug!(route = ?route, error = %error, "connect failed");
                let inner = lock_unpoisoned(&self.inner);
                inner.selector.connect_failed(&route, &error);
                Err(error)
            }
        }
    }

    pub(crate) fn connection(&self) -> Option<Arc<dyn Connection>> {
        lock_unpoisoned(&self.inner).connection.clone()
    }

    pub(crate) fn has_more_routes(&self) -> bool {
        lock_unpoisoned(&self.inner).selector.has_next()
    }

    pub(crate) fn acquire_codec(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        debug_assert!(!inner.codec_in_use);
        inner.codec_in_use = true;
    }

    /// Marks the exchange finished. If the allocation was already released
    /// while the body drained, the connection goes back to the pool now.
    pub(crate) fn release_codec(&self) {
        let parked = {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.codec_in_use = false;
            if inner.released {
                inner.connection.take()
            } else {
                None
            }
        };
        if let Some(connection) = parked {
            self.pool.release(connection);
        }
    }

    /// Drops the held connection after a failed attempt so the next one
    /// dials a fresh route instead of reusing a broken socket.
    pub(crate) fn discard_connection(&self) {
        let connection = {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.codec_in_use = false;
            inner.connection.take()
        };
        if let Some(connection) = connection {
            connection.close();
        }
    }

    pub(crate) fn codec_in_use(&self) -> bool {
        lock_unpoisoned(&self.inner).codec_in_use
    }

    /// Gives the connection back. Deferred until the body finishes when an
    /// exchange is still in flight.
    pub(crate) fn release(&self) {
        let parked = {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.released = true;
            if inner.codec_in_use {
                None
            } else {
                inner.connection.take()
            }
        };
        if let Some(connection) = parked {
            self.pool.release(connection);
        }
    }

    /// Cooperative cancel: flips the flag and closes any live socket so a
    /// blocked read or write fails promptly.
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        if let Some(connection) = self.connection() {
            connection.close();
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

/// Pipeline stage that materializes a connection and claims its exchange
/// slot before the network stages run. The slot is released when the
/// response body is closed, or by the retry stage when an attempt fails.
pub(crate) struct ConnectInterceptor;

impl Interceptor for ConnectInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let allocation = chain
            .allocation()
            .ok_or_else(|| Error::protocol("connect stage reached without an allocation"))?;
        allocation.find_connection()?;
        allocation.acquire_codec();
        let request = chain.request().clone();
        chain.proceed(request)
    }
}

/// The last pipeline stage: performs the wire exchange. Never calls
/// proceed.
pub(crate) struct TransferInterceptor {
    transport: Arc<dyn Transport>,
}

impl TransferInterceptor {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl Interceptor for TransferInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let allocation = chain
            .allocation()
            .ok_or_else(|| Error::protocol("transfer stage reached without an allocation"))?;
        let connection = allocation
            .connection()
            .ok_or_else(|| Error::protocol("transfer stage reached without a connection"))?;
        if allocation.is_canceled() {
            return Err(Error::Canceled);
        }

        let mut response = self
            .transport
            .exchange(chain.request(), connection.as_ref())?;

        let route = connection.route().clone();
        let hook_allocation = Arc::clone(allocation);
        response.map_body(|body| body.with_close_hook(move || hook_allocation.release_codec()));
        if response.body().is_none() {
            // No body to drain, the exchange is over now.
            allocation.release_codec();
        }
        Ok(response
            .into_builder()
            .route(route)
            .build()?)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, SocketAddr};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use url::Url;

    use super::{Allocation, Connection, ConnectionPool};
    use crate::error::{Error, Result, TransportErrorKind};
    use crate::route::{Address, Dns, NoProxy, Route, RouteDatabase};

    struct FixedDns(Vec<IpAddr>);

    impl Dns for FixedDns {
        fn lookup(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
            Ok(self.0.clone())
        }
    }

    struct FakeConnection {
        route: Route,
        closed: Arc<AtomicBool>,
    }

    impl Connection for FakeConnection {
        fn route(&self) -> &Route {
            &self.route
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FlakyPool {
        fail_first: AtomicUsize,
        released: AtomicUsize,
        last_closed: std::sync::Mutex<Option<Arc<AtomicBool>>>,
    }

    impl ConnectionPool for FlakyPool {
        fn connect(&self, route: &Route) -> Result<Arc<dyn Connection>> {
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
                    "http://origin.example/",
                    "connection refused",
                ));
            }
            let closed = Arc::new(AtomicBool::new(false));
            *self.last_closed.lock().unwrap() = Some(Arc::clone(&closed));
            Ok(Arc::new(FakeConnection {
                route: route.clone(),
                closed,
            }))
        }

        fn release(&self, _connection: Arc<dyn Connection>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn allocation(fail_first: usize, addresses: usize) -> (Allocation, Arc<FlakyPool>) {
        let ips: Vec<IpAddr> = (1..=addresses)
            .map(|i| format!("10.0.0.{i}").parse().unwrap())
            .collect();
        let url = Url::parse("http://origin.example/").expect("url");
        let address = Arc::new(
            Address::new(&url, None, Arc::new(NoProxy), Arc::new(FixedDns(ips))).expect("address"),
        );
        let pool = Arc::new(FlakyPool {
            fail_first: AtomicUsize::new(fail_first),
            released: AtomicUsize::new(0),
            last_closed: std::sync::Mutex::new(None),
        });
        let database = Arc::new(RouteDatabase::new());
        (
            Allocation::new(address, database, Arc::clone(&pool) as Arc<dyn ConnectionPool>),
            pool,
        )
    }

    #[test]
    fn a_connect_failure_consumes_exactly_one_candidate() {
        let (allocation, _pool) = allocation(1, 2);
        assert!(allocation.find_connection().is_err());
        assert!(allocation.has_more_routes());
        let connection = allocation.find_connection().expect("second candidate");
        assert_eq!(
            connection.route().socket_addr(),
            SocketAddr::new("10.0.0.2".parse().unwrap(), 80),
        );
    }

    #[test]
    fn the_held_connection_is_reused_across_calls() {
        let (allocation, _pool) = allocation(0, 2);
        let first = allocation.find_connection().expect("connect");
        let second = allocation.find_connection().expect("reuse");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn release_returns_the_connection_unless_an_exchange_is_draining() {
        let (allocation, pool) = allocation(0, 1);
        allocation.find_connection().expect("connect");
        allocation.acquire_codec();
        allocation.release();
        assert_eq!(pool.released.load(Ordering::SeqCst), 0);
        allocation.release_codec();
        assert_eq!(pool.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_closes_the_live_connection() {
        let (allocation, pool) = allocation(0, 1);
        allocation.find_connection().expect("connect");
        allocation.cancel();
        assert!(allocation.is_canceled());
        assert!(matches!(allocation.find_connection(), Err(Error::Canceled)));
        let closed = pool.last_closed.lock().unwrap().clone().expect("dialed");
        assert!(closed.load(Ordering::SeqCst));
    }
}
