//! `httpcall` is a call-execution engine for HTTP clients: it turns a
//! prepared request into a delivered response while enforcing concurrency
//! limits, running an interceptor pipeline, retrying over alternate routes,
//! following redirects, and caching responses on disk. The wire transfer
//! itself is pluggable; supply a [`Transport`] and a [`ConnectionPool`] for
//! your I/O stack.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use httpcall::{Client, HttpCache, Request};
//! # fn transport() -> Arc<dyn httpcall::Transport> { unimplemented!() }
//! # fn pool() -> Arc<dyn httpcall::ConnectionPool> { unimplemented!() }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .connection_pool(pool())
//!         .transport(transport())
//!         .cache(HttpCache::open("/tmp/http-cache", 50 << 20)?)
//!         .build()?;
//!
//!     let call = client.new_call(Request::get("https://example.com/")?);
//!     let mut response = call.execute()?;
//!     println!("{}", response.status());
//!     if let Some(body) = response.take_body() {
//!         let bytes = body.read_to_bytes()?;
//!         println!("{} bytes", bytes.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Execution model
//!
//! - [`Call::execute`] runs on the calling thread; [`Call::enqueue`] runs on
//!   the [`Dispatcher`]'s worker pool, subject to its global and per-host
//!   caps.
//! - Calls are single-use and cancelable at any point; cancellation closes
//!   the call's live socket.
//! - The pipeline order is fixed: application interceptors, retry and
//!   follow-up, bridge, cache, connect, network interceptors, transfer.

mod body;
mod bridge;
mod cache;
mod call;
mod connection;
mod dispatcher;
mod error;
mod followup;
mod http_cache;
mod interceptor;
mod request;
mod response;
mod route;
mod util;

pub use crate::body::{Body, OneShotBody, ResponseBody};
pub use crate::bridge::{ContentDecoder, CookieJar, IdentityDecoder, NoCookies};
pub use crate::cache::{DiskCache, Editor, Snapshot};
pub use crate::call::{Call, Client, ClientBuilder};
pub use crate::connection::{Connection, ConnectionPool, Transport};
pub use crate::dispatcher::Dispatcher;
pub use crate::error::{Error, ErrorCode, Result, TransportErrorKind};
pub use crate::followup::{Authenticator, NoAuthentication, MAX_FOLLOW_UPS};
pub use crate::http_cache::HttpCache;
pub use crate::interceptor::{Chain, Interceptor};
pub use crate::request::{Request, RequestBuilder};
pub use crate::response::{Response, ResponseBuilder};
pub use crate::route::{
    Address, Dns, NoProxy, Proxy, ProxySelector, Route, RouteDatabase, RouteSelector, SystemDns,
};
