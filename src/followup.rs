use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use http::{Method, StatusCode};
use tracing::debug;
use url::Url;

use crate::body::Body;
use crate::connection::{Allocation, ConnectionPool};
use crate::error::{Error, Result, TransportErrorKind};
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::Response;
use crate::route::{Address, Dns, Proxy, ProxySelector, Route, RouteDatabase};
use crate::util::lock_unpoisoned;

/// How many follow-up requests (redirects, auth challenges, timeout
/// replays) one call may issue before giving up. Chrome follows 21, Firefox
/// and Safari 20.
pub const MAX_FOLLOW_UPS: u32 = 20;

/// Reacts to 401 and 407 challenges by producing a request with
/// credentials attached, or `None` to give up.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, route: Option<&Route>, response: &Response) -> Result<Option<Request>>;
}

/// The default authenticator never answers a challenge.
pub struct NoAuthentication;

impl Authenticator for NoAuthentication {
    fn authenticate(&self, _route: Option<&Route>, _response: &Response) -> Result<Option<Request>> {
        Ok(None)
    }
}

/// Whether a failed attempt may be retried on another route. Pure over the
/// failure classification; the caller layers replayability and route
/// availability on top.
fn is_recoverable(kind: TransportErrorKind, request_sent: bool) -> bool {
    match kind {
        // Another route cannot produce a different verdict on a bad
        // certificate.
        TransportErrorKind::CertificateVerification | TransportErrorKind::CertificatePinning => {
            false
        }
        // A timeout before any bytes went out means the server never saw
        // the request; after that we cannot know.
        TransportErrorKind::ConnectTimeout => !request_sent,
        TransportErrorKind::ReadTimeout => false,
        TransportErrorKind::Dns
        | TransportErrorKind::Connect
        | TransportErrorKind::TlsHandshake
        | TransportErrorKind::Reset
        | TransportErrorKind::Other => true,
    }
}

/// Status codes 300..=303 demote most methods to GET on redirect.
fn redirects_to_get(method: &Method) -> bool {
    method.as_str() != "PROPFIND"
}

/// Drives one call to a final response: dispatches attempts down the rest
/// of the pipeline, recovers from retryable transport failures on fresh
/// routes, and chases redirect/auth/timeout follow-ups up to
/// [`MAX_FOLLOW_UPS`] times. Also the call's cancellation point.
pub(crate) struct RetryAndFollowUpInterceptor {
    pool: Arc<dyn ConnectionPool>,
    route_database: Arc<RouteDatabase>,
    dns: Arc<dyn Dns>,
    proxy_selector: Arc<dyn ProxySelector>,
    proxy: Option<Proxy>,
    authenticator: Arc<dyn Authenticator>,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    retry_on_connection_failure: bool,
    canceled: AtomicBool,
    allocation: Mutex<Option<Arc<Allocation>>>,
}

impl RetryAndFollowUpInterceptor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pool: Arc<dyn ConnectionPool>,
        route_database: Arc<RouteDatabase>,
        dns: Arc<dyn Dns>,
        proxy_selector: Arc<dyn ProxySelector>,
        proxy: Option<Proxy>,
        authenticator: Arc<dyn Authenticator>,
        follow_redirects: bool,
        follow_ssl_redirects: bool,
        retry_on_connection_failure: bool,
    ) -> Self {
        Self {
            pool,
            route_database,
            dns,
            proxy_selector,
            proxy,
            authenticator,
            follow_redirects,
            follow_ssl_redirects,
            retry_on_connection_failure,
            canceled: AtomicBool::new(false),
            allocation: Mutex::new(None),
        }
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        if let Some(allocation) = lock_unpoisoned(&self.allocation).clone() {
            allocation.cancel();
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn new_allocation(&self, request: &Request) -> Result<Arc<Allocation>> {
        let address = Address::new(
            request.url(),
            self.proxy.clone(),
            Arc::clone(&self.proxy_selector),
            Arc::clone(&self.dns),
        )?;
        let allocation = Arc::new(Allocation::new(
            Arc::new(address),
            Arc::clone(&self.route_database),
            Arc::clone(&self.pool),
        ));
        if self.is_canceled() {
            allocation.cancel();
        }
        *lock_unpoisoned(&self.allocation) = Some(Arc::clone(&allocation));
        Ok(allocation)
    }

    fn recover(&self, error: &Error, request: &Request, allocation: &Allocation) -> bool {
        if !self.retry_on_connection_failure {
            return false;
        }
        let Error::Transport {
            kind, request_sent, ..
        } = error
        else {
            return false;
        };
        if *request_sent && !request.body().is_replayable() {
            return false;
        }
        if !is_recoverable(*kind, *request_sent) {
            return false;
        }
        allocation.has_more_routes()
    }

    /// Computes the next request a response demands, or `None` when the
    /// response is final. Protocol-shaped impossibilities are errors.
    fn follow_up_request(&self, response: &Response) -> Result<Option<Request>> {
        let route = response.route();
        match response.status() {
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                let proxy = route
                    .map(|route| route.proxy().clone())
                    .or_else(|| self.proxy.clone())
                    .unwrap_or(Proxy::Direct);
                if !matches!(proxy, Proxy::Http { .. }) {
                    return Err(Error::protocol(
                        "received HTTP 407 from a server not acting as an HTTP proxy",
                    ));
                }
                self.authenticator.authenticate(route, response)
            }
            StatusCode::UNAUTHORIZED => self.authenticator.authenticate(route, response),
            StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => {
                // 307/308 forbid changing the method, so only follow the
                // methods whose replay is trivially safe.
                let method = response.request().method();
                if method != Method::GET && method != Method::HEAD {
                    return Ok(None);
                }
                self.build_redirect(response, true)
            }
            StatusCode::MULTIPLE_CHOICES
            | StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER => self.build_redirect(response, false),
            StatusCode::REQUEST_TIMEOUT => {
                if !self.retry_on_connection_failure {
                    return Ok(None);
                }
                if !response.request().body().is_replayable() {
                    return Ok(None);
                }
                if response
                    .prior_response()
                    .is_some_and(|prior| prior.status() == StatusCode::REQUEST_TIMEOUT)
                {
                    // The replay timed out too. Stop here.
                    return Ok(None);
                }
                Ok(Some(response.request().clone()))
            }
            _ => Ok(None),
        }
    }

    fn build_redirect(&self, response: &Response, preserve_method: bool) -> Result<Option<Request>> {
        if !self.follow_redirects {
            return Ok(None);
        }
        let Some(location) = response.header("location") else {
            return Ok(None);
        };
        let current = response.request().url();
        let Ok(target) = current.join(location) else {
            return Ok(None);
        };
        match target.scheme() {
            "http" | "https" => {}
            _ => return Ok(None),
        }
        if target.scheme() != current.scheme() && !self.follow_ssl_redirects {
            return Ok(None);
        }

        let method = response.request().method().clone();
        let mut builder = response.request().clone().into_builder().url(target.clone());
        if !preserve_method && method != Method::GET && method != Method::HEAD {
            if redirects_to_get(&method) {
                builder = builder
                    .method(Method::GET)
                    .body(Body::empty())
                    .remove_header("transfer-encoding")
                    .remove_header("content-length")
                    .remove_header("content-type");
            }
            // Methods that redirect with their body keep it as-is.
        }

        if !same_connection(current, &target) {
            // Credentials were issued for the original host.
            builder = builder.remove_header("authorization");
        }
        Ok(Some(builder.build()?))
    }
}

fn same_connection(current: &Url, target: &Url) -> bool {
    current.host_str() == target.host_str()
        && current.port_or_known_default() == target.port_or_known_default()
        && current.scheme() == target.scheme()
}

impl Interceptor for RetryAndFollowUpInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let mut request = chain.request().clone();
        let mut allocation = self.new_allocation(&request)?;
        let mut prior_response: Option<Response> = None;
        let mut follow_up_count: u32 = 0;

        loop {
            if self.is_canceled() {
                allocation.release();
                return Err(Error::Canceled);
            }

            let mut response =
                match chain.proceed_with(request.clone(), Arc::clone(&allocation)) {
                    Ok(response) => response,
                    Err(error) => {
                        // The attempt may have left a claimed exchange on a
                        // connection in an unknown state.
                        allocation.discard_connection();
                        if self.recover(&error, &request, &allocation) {
                            debug!(error = %error, "recovering on the next route");
                            continue;
                        }
                        allocation.release();
                        return Err(error);
                    }
                };

            if let Some(prior) = prior_response.take() {
                response.set_prior_response(prior);
            }

            let Some(next) = self.follow_up_request(&response)? else {
                allocation.release();
                return Ok(response);
            };

            follow_up_count += 1;
            if follow_up_count > MAX_FOLLOW_UPS {
                allocation.release();
                return Err(Error::TooManyFollowUps {
                    count: follow_up_count,
                });
            }

            response.close_body();
            if !same_connection(response.request().url(), next.url()) {
                allocation.release();
                allocation = self.new_allocation(&next)?;
            } else if allocation.codec_in_use() {
                return Err(Error::protocol(
                    "closing the response body failed to release its exchange",
                ));
            }

            request = next;
            prior_response = Some(response);
        }
    }
}
