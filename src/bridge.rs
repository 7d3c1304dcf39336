use std::io::Read;
use std::sync::Arc;

use http::header;
use url::Url;

use crate::body::ResponseBody;
use crate::error::Result;
use crate::interceptor::{Chain, Interceptor};
use crate::response::Response;

const DEFAULT_USER_AGENT: &str = concat!("httpcall/", env!("CARGO_PKG_VERSION"));

/// Cookie storage strategy. The engine asks it for the `Cookie` header on
/// the way out and hands it every `Set-Cookie` value on the way back.
pub trait CookieJar: Send + Sync {
    /// Cookie pairs (`name=value`) to attach for `url`.
    fn load(&self, url: &Url) -> Vec<String>;
    fn save(&self, url: &Url, set_cookie_values: &[String]);
}

/// The default jar: remembers nothing.
pub struct NoCookies;

impl CookieJar for NoCookies {
    fn load(&self, _url: &Url) -> Vec<String> {
        Vec::new()
    }

    fn save(&self, _url: &Url, _set_cookie_values: &[String]) {}
}

/// Decompression strategy for transparently-negotiated gzip. The codec
/// itself is an external collaborator; the default passes bytes through.
pub trait ContentDecoder: Send + Sync {
    fn gzip(&self, compressed: Box<dyn Read + Send>) -> Box<dyn Read + Send>;
}

pub struct IdentityDecoder;

impl ContentDecoder for IdentityDecoder {
    fn gzip(&self, compressed: Box<dyn Read + Send>) -> Box<dyn Read + Send> {
        compressed
    }
}

/// Bridges the application's request to wire form and undoes the wire-level
/// transforms on the response: fills in `Host`, `Connection`, body framing
/// headers, cookies and `User-Agent`, asks for gzip when the caller did not
/// express a preference, and strips the gzip framing when the answer used
/// it.
pub(crate) struct BridgeInterceptor {
    cookie_jar: Arc<dyn CookieJar>,
    decoder: Arc<dyn ContentDecoder>,
}

impl BridgeInterceptor {
    pub(crate) fn new(cookie_jar: Arc<dyn CookieJar>, decoder: Arc<dyn ContentDecoder>) -> Self {
        Self { cookie_jar, decoder }
    }
}

impl Interceptor for BridgeInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let caller_request = chain.request().clone();
        let url = caller_request.url().clone();
        let mut builder = caller_request.clone().into_builder();

        match caller_request.body().transfer_length() {
            Some(0) if caller_request.body().is_empty() => {}
            Some(length) => {
                builder = builder
                    .set_header("content-length", &length.to_string())?
                    .remove_header("transfer-encoding");
            }
            None => {
                builder = builder
                    .set_header("transfer-encoding", "chunked")?
                    .remove_header("content-length");
            }
        }

        if caller_request.header("host").is_none() {
            builder = builder.set_header("host", &host_header(&url))?;
        }
        if caller_request.header("connection").is_none() {
            builder = builder.set_header("connection", "Keep-Alive")?;
        }

        // Only ask for gzip when the caller expressed no preference; that
        // way we know the answer is ours to unwrap.
        let transparent_gzip = caller_request.header("accept-encoding").is_none()
            && caller_request.header("range").is_none();
        if transparent_gzip {
            builder = builder.set_header("accept-encoding", "gzip")?;
        }

        let cookies = self.cookie_jar.load(&url);
        if !cookies.is_empty() {
            builder = builder.set_header("cookie", &cookies.join("; "))?;
        }
        if caller_request.header("user-agent").is_none() {
            builder = builder.set_header("user-agent", DEFAULT_USER_AGENT)?;
        }

        let mut response = chain.proceed(builder.build()?)?;

        let set_cookies: Vec<String> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_owned)
            .collect();
        if !set_cookies.is_empty() {
            self.cookie_jar.save(&url, &set_cookies);
        }

        let served_gzip = response
            .header("content-encoding")
            .is_some_and(|encoding| encoding.eq_ignore_ascii_case("gzip"));
        if transparent_gzip && served_gzip {
            response.headers_mut().remove(header::CONTENT_ENCODING);
            response.headers_mut().remove(header::CONTENT_LENGTH);
            let decoder = Arc::clone(&self.decoder);
            response.map_body(|body| {
                // The wrapped body keeps its close hook alive underneath.
                ResponseBody::from_reader(decoder.gzip(Box::new(body)), None)
            });
        }

        Ok(response)
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}
