use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::bridge::{BridgeInterceptor, ContentDecoder, CookieJar, IdentityDecoder, NoCookies};
use crate::connection::{ConnectInterceptor, ConnectionPool, TransferInterceptor, Transport};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::followup::{Authenticator, NoAuthentication, RetryAndFollowUpInterceptor};
use crate::http_cache::{CacheInterceptor, HttpCache};
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::Response;
use crate::route::{Dns, NoProxy, Proxy, ProxySelector, RouteDatabase, SystemDns};
use crate::util::lock_unpoisoned;

struct ClientInner {
    dispatcher: Arc<Dispatcher>,
    pool: Arc<dyn ConnectionPool>,
    transport: Arc<dyn Transport>,
    dns: Arc<dyn Dns>,
    proxy_selector: Arc<dyn ProxySelector>,
    proxy: Option<Proxy>,
    cookie_jar: Arc<dyn CookieJar>,
    authenticator: Arc<dyn Authenticator>,
    decoder: Arc<dyn ContentDecoder>,
    cache: Option<Arc<HttpCache>>,
    route_database: Arc<RouteDatabase>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    retry_on_connection_failure: bool,
    serve_stale: bool,
}

/// The engine's front door. Cheap to clone; all clones share the
/// dispatcher, route database, cache and pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn cache(&self) -> Option<&HttpCache> {
        self.inner.cache.as_deref()
    }

    /// Prepares `request` for execution. The returned call is single-use.
    pub fn new_call(&self, request: Request) -> Call {
        let retry_stage = Arc::new(RetryAndFollowUpInterceptor::new(
            Arc::clone(&self.inner.pool),
            Arc::clone(&self.inner.route_database),
            Arc::clone(&self.inner.dns),
            Arc::clone(&self.inner.proxy_selector),
            self.inner.proxy.clone(),
            Arc::clone(&self.inner.authenticator),
            self.inner.follow_redirects,
            self.inner.follow_ssl_redirects,
            self.inner.retry_on_connection_failure,
        ));
        Call {
            inner: Arc::new(CallInner {
                client: Arc::clone(&self.inner),
                request,
                executed: AtomicBool::new(false),
                retry_stage,
                async_call: Mutex::new(None),
            }),
        }
    }
}

pub struct ClientBuilder {
    dispatcher: Option<Arc<Dispatcher>>,
    pool: Option<Arc<dyn ConnectionPool>>,
    transport: Option<Arc<dyn Transport>>,
    dns: Arc<dyn Dns>,
    proxy_selector: Arc<dyn ProxySelector>,
    proxy: Option<Proxy>,
    cookie_jar: Arc<dyn CookieJar>,
    authenticator: Arc<dyn Authenticator>,
    decoder: Arc<dyn ContentDecoder>,
    cache: Option<Arc<HttpCache>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    retry_on_connection_failure: bool,
    serve_stale: bool,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            dispatcher: None,
            pool: None,
            transport: None,
            dns: Arc::new(SystemDns),
            proxy_selector: Arc::new(NoProxy),
            proxy: None,
            cookie_jar: Arc::new(NoCookies),
            authenticator: Arc::new(NoAuthentication),
            decoder: Arc::new(IdentityDecoder),
            cache: None,
            interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            follow_redirects: true,
            follow_ssl_redirects: true,
            retry_on_connection_failure: true,
            serve_stale: false,
        }
    }

    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn connection_pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.dns = dns;
        self
    }

    pub fn proxy_selector(mut self, proxy_selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy_selector = proxy_selector;
        self
    }

    /// An explicit proxy for every call, overriding the selector.
    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn cookie_jar(mut self, cookie_jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = cookie_jar;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn content_decoder(mut self, decoder: Arc<dyn ContentDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn cache(mut self, cache: HttpCache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// Runs before the retry stage; sees each call exactly once.
    pub fn add_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Runs after a connection is established; sees every attempt.
    pub fn add_network_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.network_interceptors.push(interceptor);
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn follow_ssl_redirects(mut self, follow: bool) -> Self {
        self.follow_ssl_redirects = follow;
        self
    }

    pub fn retry_on_connection_failure(mut self, retry: bool) -> Self {
        self.retry_on_connection_failure = retry;
        self
    }

    /// Serve an expired cache hit immediately, flagged intermediate,
    /// instead of going to the network. The caller decides when to
    /// re-issue for a fresh copy.
    pub fn serve_stale(mut self, serve: bool) -> Self {
        self.serve_stale = serve;
        self
    }

    pub fn build(self) -> Result<Client> {
        let pool = self.pool.ok_or_else(|| Error::Configuration {
            message: "a connection pool is required".to_owned(),
        })?;
        let transport = self.transport.ok_or_else(|| Error::Configuration {
            message: "a transport is required".to_owned(),
        })?;
        Ok(Client {
            inner: Arc::new(ClientInner {
                dispatcher: self.dispatcher.unwrap_or_default(),
                pool,
                transport,
                dns: self.dns,
                proxy_selector: self.proxy_selector,
                proxy: self.proxy,
                cookie_jar: self.cookie_jar,
                authenticator: self.authenticator,
                decoder: self.decoder,
                cache: self.cache,
                route_database: Arc::new(RouteDatabase::new()),
                interceptors: self.interceptors,
                network_interceptors: self.network_interceptors,
                follow_redirects: self.follow_redirects,
                follow_ssl_redirects: self.follow_ssl_redirects,
                retry_on_connection_failure: self.retry_on_connection_failure,
                serve_stale: self.serve_stale,
            }),
        })
    }
}

struct CallInner {
    client: Arc<ClientInner>,
    request: Request,
    executed: AtomicBool,
    retry_stage: Arc<RetryAndFollowUpInterceptor>,
    async_call: Mutex<Option<Arc<AsyncCall>>>,
}

/// A single request/response exchange, possibly spanning retries and
/// follow-ups. Execute it exactly once, synchronously or via the
/// dispatcher.
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Runs the call on the current thread.
    pub fn execute(&self) -> Result<Response> {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyExecuted);
        }
        let token = Arc::new(SyncToken {
            retry_stage: Arc::clone(&self.inner.retry_stage),
        });
        self.inner.client.dispatcher.executed(Arc::clone(&token));
        let result = run_pipeline(&self.inner);
        self.inner.client.dispatcher.finished_sync(&token);
        result
    }

    /// Submits the call to the dispatcher. The callback runs on a worker
    /// thread with the outcome, exactly once.
    pub fn enqueue(&self, callback: impl FnOnce(Result<Response>) + Send + 'static) {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            callback(Err(Error::AlreadyExecuted));
            return;
        }
        let async_call = Arc::new(AsyncCall {
            call: Arc::clone(&self.inner),
            callback: Mutex::new(Some(Box::new(callback))),
        });
        *lock_unpoisoned(&self.inner.async_call) = Some(Arc::clone(&async_call));
        self.inner.client.dispatcher.enqueue(async_call);
    }

    /// Cooperatively cancels the call. A queued call leaves the queue and
    /// completes as canceled; a running call aborts at its next
    /// cancellation point, closing any live socket.
    pub fn cancel(&self) {
        self.inner.retry_stage.cancel();
        let queued = lock_unpoisoned(&self.inner.async_call).clone();
        if let Some(async_call) = queued {
            self.inner.client.dispatcher.remove_queued(&async_call);
        }
    }

    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.retry_stage.is_canceled()
    }
}

/// A synchronous call's presence in the dispatcher, kept while it occupies
/// a slot so `cancel_all` can reach it.
pub(crate) struct SyncToken {
    retry_stage: Arc<RetryAndFollowUpInterceptor>,
}

impl SyncToken {
    pub(crate) fn cancel(&self) {
        self.retry_stage.cancel();
    }
}

type Callback = Box<dyn FnOnce(Result<Response>) + Send>;

/// A call queued for dispatch, carrying its completion callback.
pub(crate) struct AsyncCall {
    call: Arc<CallInner>,
    callback: Mutex<Option<Callback>>,
}

impl AsyncCall {
    pub(crate) fn host(&self) -> &str {
        self.call.request.host()
    }

    pub(crate) fn cancel(&self) {
        self.call.retry_stage.cancel();
    }

    pub(crate) fn run(self: Arc<Self>) {
        let result = if self.call.retry_stage.is_canceled() {
            Err(Error::Canceled)
        } else {
            run_pipeline(&self.call)
        };
        self.deliver(result);
        self.call.client.dispatcher.finished_async(&self);
    }

    /// Completes a call that was removed from the queue before running.
    pub(crate) fn finish_canceled(self: Arc<Self>) {
        self.deliver(Err(Error::Canceled));
    }

    fn deliver(&self, result: Result<Response>) {
        if let Some(callback) = lock_unpoisoned(&self.callback).take() {
            callback(result);
        }
    }
}

/// Assembles the pipeline for one call and drives it. Stage order is
/// fixed: application stages, retry/follow-up, bridge, cache, connect,
/// network stages, transfer.
fn run_pipeline(call: &CallInner) -> Result<Response> {
    let client = &call.client;
    let mut interceptors: Vec<Arc<dyn Interceptor>> =
        Vec::with_capacity(client.interceptors.len() + client.network_interceptors.len() + 5);
    interceptors.extend(client.interceptors.iter().cloned());
    interceptors.push(Arc::clone(&call.retry_stage) as Arc<dyn Interceptor>);
    interceptors.push(Arc::new(BridgeInterceptor::new(
        Arc::clone(&client.cookie_jar),
        Arc::clone(&client.decoder),
    )));
    if let Some(cache) = &client.cache {
        interceptors.push(Arc::new(CacheInterceptor::new(
            Arc::clone(cache),
            client.serve_stale,
        )));
    }
    interceptors.push(Arc::new(ConnectInterceptor));
    interceptors.extend(client.network_interceptors.iter().cloned());
    interceptors.push(Arc::new(TransferInterceptor::new(Arc::clone(
        &client.transport,
    ))));

    let mut chain = Chain::new(&interceptors, call.request.clone());
    let request = call.request.clone();
    chain.proceed(request)
}
