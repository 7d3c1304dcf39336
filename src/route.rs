use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use url::Url;

use crate::error::{Error, Result, TransportErrorKind};
use crate::util::lock_unpoisoned;

/// Abstract hostname → addresses lookup. DNS itself is an external
/// collaborator; the default goes through the OS resolver.
pub trait Dns: Send + Sync {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

pub struct SystemDns;

impl Dns for SystemDns {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addresses: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()?
            .map(|socket_addr| socket_addr.ip())
            .collect();
        if addresses.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {host}"),
            ));
        }
        Ok(addresses)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Proxy {
    Direct,
    Http { host: String, port: u16 },
    Socks { host: String, port: u16 },
}

impl Proxy {
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }
}

/// Chooses which proxies to attempt for a target URL, and hears about
/// connect failures through non-direct proxies.
pub trait ProxySelector: Send + Sync {
    fn select(&self, url: &Url) -> Vec<Proxy>;
    fn connect_failed(&self, _url: &Url, _proxy: &Proxy, _error: &Error) {}
}

/// The default selector: always connect directly.
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _url: &Url) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}

/// The identity of a connection target: where to connect and how. Two
/// addresses are equal only if every field matches, including the proxy
/// selection and DNS strategies (compared by handle identity).
#[derive(Clone)]
pub struct Address {
    host: String,
    port: u16,
    uses_tls: bool,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    dns: Arc<dyn Dns>,
    url: Url,
}

impl Address {
    pub(crate) fn new(
        url: &Url,
        proxy: Option<Proxy>,
        proxy_selector: Arc<dyn ProxySelector>,
        dns: Arc<dyn Dns>,
    ) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl {
                url: url.to_string(),
            })?
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(80);
        Ok(Self {
            host,
            port,
            uses_tls: url.scheme() == "https",
            proxy,
            proxy_selector,
            dns,
            url: url.clone(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uses_tls(&self) -> bool {
        self.uses_tls
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn dns(&self) -> &Arc<dyn Dns> {
        &self.dns
    }

    pub(crate) fn proxy_selector(&self) -> &Arc<dyn ProxySelector> {
        &self.proxy_selector
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.uses_tls == other.uses_tls
            && self.proxy == other.proxy
            && Arc::ptr_eq(&self.proxy_selector, &other.proxy_selector)
            && Arc::ptr_eq(&self.dns, &other.dns)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.uses_tls.hash(state);
        self.proxy.hash(state);
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Address")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("uses_tls", &self.uses_tls)
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// One concrete way to reach a server: the abstract address, the proxy to
/// go through, and the resolved socket address to dial.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Route {
    address: Arc<Address>,
    proxy: Proxy,
    socket_addr: SocketAddr,
}

impl Route {
    pub(crate) fn new(address: Arc<Address>, proxy: Proxy, socket_addr: SocketAddr) -> Self {
        Self {
            address,
            proxy,
            socket_addr,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// An HTTPS origin reached through an HTTP proxy needs a CONNECT tunnel.
    pub fn requires_tunnel(&self) -> bool {
        self.address.uses_tls() && matches!(self.proxy, Proxy::Http { .. })
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Route")
            .field("host", &self.address.host())
            .field("proxy", &self.proxy)
            .field("socket_addr", &self.socket_addr)
            .finish()
    }
}

/// Shared memory of routes that recently failed. Membership defers a route
/// to the end of the enumeration; it never removes it outright.
#[derive(Default)]
pub struct RouteDatabase {
    failed: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failed(&self, route: &Route) {
        lock_unpoisoned(&self.failed).insert(route.clone());
    }

    /// Forget a failure after the route works again.
    pub fn connected(&self, route: &Route) {
        lock_unpoisoned(&self.failed).remove(route);
    }

    pub fn should_postpone(&self, route: &Route) -> bool {
        lock_unpoisoned(&self.failed).contains(route)
    }
}

/// Enumerates connection candidates for one address: every resolved socket
/// address of the current proxy before the next proxy, and only then any
/// routes postponed because they recently failed, in deferral order.
pub struct RouteSelector {
    address: Arc<Address>,
    route_database: Arc<RouteDatabase>,
    proxies: Vec<Proxy>,
    next_proxy_index: usize,
    last_proxy: Option<Proxy>,
    socket_addrs: Vec<SocketAddr>,
    next_socket_addr_index: usize,
    postponed_routes: Vec<Route>,
}

impl RouteSelector {
    pub fn new(address: Arc<Address>, route_database: Arc<RouteDatabase>) -> Self {
        let proxies = match address.proxy() {
            // An explicit proxy is tried, and only it.
            Some(proxy) => vec![proxy.clone()],
            None => {
                let selected = address.proxy_selector().select(address.url());
                if selected.is_empty() {
                    vec![Proxy::Direct]
                } else {
                    selected
                }
            }
        };
        Self {
            address,
            route_database,
            proxies,
            next_proxy_index: 0,
            last_proxy: None,
            socket_addrs: Vec::new(),
            next_socket_addr_index: 0,
            postponed_routes: Vec::new(),
        }
    }

    pub fn has_next(&self) -> bool {
        self.has_next_socket_addr() || self.has_next_proxy() || self.has_next_postponed()
    }

    pub fn next(&mut self) -> Result<Route> {
        loop {
            if !self.has_next_socket_addr() {
                if !self.has_next_proxy() {
                    if !self.has_next_postponed() {
                        return Err(Error::NoRouteAvailable {
                            host: self.address.host().to_owned(),
                        });
                    }
                    return Ok(self.postponed_routes.remove(0));
                }
                let proxy = self.next_proxy()?;
                self.last_proxy = Some(proxy);
            }

            let socket_addr = self.socket_addrs[self.next_socket_addr_index];
            self.next_socket_addr_index += 1;
            let proxy = self.last_proxy.clone().unwrap_or(Proxy::Direct);
            let route = Route::new(Arc::clone(&self.address), proxy, socket_addr);

            if self.route_database.should_postpone(&route) {
                // Known-bad routes are tried last, not skipped.
                self.postponed_routes.push(route);
                continue;
            }
            return Ok(route);
        }
    }

    /// Records a connectivity failure on a route handed out by this
    /// selector, and tells the proxy selection strategy when a non-direct
    /// proxy was involved.
    pub fn connect_failed(&self, route: &Route, error: &Error) {
        if !route.proxy().is_direct() {
            self.address
                .proxy_selector()
                .connect_failed(self.address.url(), route.proxy(), error);
        }
        self.route_database.failed(route);
    }

    fn has_next_proxy(&self) -> bool {
        self.next_proxy_index < self.proxies.len()
    }

    fn has_next_socket_addr(&self) -> bool {
        self.next_socket_addr_index < self.socket_addrs.len()
    }

    fn has_next_postponed(&self) -> bool {
        !self.postponed_routes.is_empty()
    }

    fn next_proxy(&mut self) -> Result<Proxy> {
        let proxy = self.proxies[self.next_proxy_index].clone();
        self.next_proxy_index += 1;
        self.reset_next_socket_addr(&proxy)?;
        Ok(proxy)
    }

    /// Resolves the dial targets for `proxy`: the origin host for direct
    /// connections, the proxy host for HTTP proxies, and a single
    /// unresolved (host, port) for SOCKS, whose resolver does the lookup.
    fn reset_next_socket_addr(&mut self, proxy: &Proxy) -> Result<()> {
        self.socket_addrs = Vec::new();
        self.next_socket_addr_index = 0;

        let (socket_host, socket_port) = match proxy {
            Proxy::Direct => (self.address.host().to_owned(), self.address.port()),
            Proxy::Http { host, port } => (host.clone(), *port),
            Proxy::Socks { .. } => (self.address.host().to_owned(), self.address.port()),
        };
        if socket_port == 0 {
            return Err(Error::transport(
                TransportErrorKind::Connect,
                false,
                self.address.url().as_str(),
                format!("no route to {socket_host}:{socket_port}; port is out of range"),
            ));
        }

        if matches!(proxy, Proxy::Socks { .. }) {
            // SOCKS proxies resolve the origin themselves; keep the name.
            if let Ok(mut resolved) = (socket_host.as_str(), socket_port).to_socket_addrs() {
                if let Some(first) = resolved.next() {
                    self.socket_addrs.push(first);
                    return Ok(());
                }
            }
            return Err(Error::transport(
                TransportErrorKind::Dns,
                false,
                self.address.url().as_str(),
                format!("failed to resolve socks proxy {socket_host}"),
            ));
        }

        // Keep every resolved address to behave well in mixed IPv4/IPv6
        // environments.
        let addresses = self
            .address
            .dns()
            .lookup(&socket_host)
            .map_err(|source| {
                Error::transport_io(
                    TransportErrorKind::Dns,
                    false,
                    self.address.url().as_str(),
                    source,
                )
            })?;
        for ip in addresses {
            self.socket_addrs.push(SocketAddr::new(ip, socket_port));
        }
        if self.socket_addrs.is_empty() {
            return Err(Error::transport(
                TransportErrorKind::Dns,
                false,
                self.address.url().as_str(),
                format!("dns returned no addresses for {socket_host}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::IpAddr;
    use std::sync::Arc;

    use url::Url;

    use super::{Address, Dns, NoProxy, Proxy, ProxySelector, Route, RouteDatabase, RouteSelector};
    use crate::error::Error;

    struct FixedDns(Vec<IpAddr>);

    impl Dns for FixedDns {
        fn lookup(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            Ok(self.0.clone())
        }
    }

    struct TwoProxies;

    impl ProxySelector for TwoProxies {
        fn select(&self, _url: &Url) -> Vec<Proxy> {
            vec![
                Proxy::Http {
                    host: "proxy-a".into(),
                    port: 8080,
                },
                Proxy::Http {
                    host: "proxy-b".into(),
                    port: 8080,
                },
            ]
        }
    }

    fn address(selector: Arc<dyn ProxySelector>, dns: Arc<dyn Dns>) -> Arc<Address> {
        let url = Url::parse("http://origin.example:7000/").expect("url");
        Arc::new(Address::new(&url, None, selector, dns).expect("address"))
    }

    fn routes(selector: &mut RouteSelector) -> Vec<Route> {
        let mut collected = Vec::new();
        while selector.has_next() {
            collected.push(selector.next().expect("next while has_next"));
        }
        collected
    }

    #[test]
    fn all_addresses_of_a_proxy_come_before_the_next_proxy() {
        let dns: Arc<dyn Dns> = Arc::new(FixedDns(vec![
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        ]));
        let address = address(Arc::new(TwoProxies), dns);
        let mut selector = RouteSelector::new(address, Arc::new(RouteDatabase::new()));

        let all = routes(&mut selector);
        assert_eq!(all.len(), 4);
        assert!(all[..2].iter().all(|route| matches!(
            route.proxy(),
            Proxy::Http { host, .. } if host == "proxy-a"
        )));
        assert!(all[2..].iter().all(|route| matches!(
            route.proxy(),
            Proxy::Http { host, .. } if host == "proxy-b"
        )));
        assert!(!selector.has_next());
        assert!(matches!(
            selector.next(),
            Err(Error::NoRouteAvailable { .. })
        ));
    }

    #[test]
    fn failed_routes_are_postponed_to_the_end_not_dropped() {
        let dns: Arc<dyn Dns> = Arc::new(FixedDns(vec![
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        ]));
        let database = Arc::new(RouteDatabase::new());
        let address = address(Arc::new(NoProxy), Arc::clone(&dns));

        // First pass: remember the first route as failed.
        let mut first_pass = RouteSelector::new(Arc::clone(&address), Arc::clone(&database));
        let first_route = first_pass.next().expect("route");
        first_pass.connect_failed(
            &first_route,
            &Error::protocol("test"),
        );

        // Second pass: the failed route must come last, but still come.
        let mut second_pass = RouteSelector::new(address, database);
        let all = routes(&mut second_pass);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1], first_route);
        assert_ne!(all[0], first_route);
    }

    #[test]
    fn every_candidate_is_enumerated_exactly_once() {
        let dns: Arc<dyn Dns> = Arc::new(FixedDns(vec![
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
        ]));
        let address = address(Arc::new(TwoProxies), dns);
        let mut selector = RouteSelector::new(address, Arc::new(RouteDatabase::new()));

        let all = routes(&mut selector);
        let mut unique: Vec<_> = all.clone();
        unique.dedup_by(|a, b| a == b);
        assert_eq!(all.len(), 6);
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn connected_clears_failure_memory() {
        let dns: Arc<dyn Dns> = Arc::new(FixedDns(vec!["10.0.0.1".parse().unwrap()]));
        let database = Arc::new(RouteDatabase::new());
        let address = address(Arc::new(NoProxy), dns);
        let mut selector = RouteSelector::new(Arc::clone(&address), Arc::clone(&database));
        let route = selector.next().expect("route");

        database.failed(&route);
        assert!(database.should_postpone(&route));
        database.connected(&route);
        assert!(!database.should_postpone(&route));
    }
}
