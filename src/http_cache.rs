use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use http::{HeaderMap, Method, StatusCode};
use tracing::debug;
use url::Url;

use crate::body::ResponseBody;
use crate::cache::{DiskCache, Editor, Snapshot};
use crate::error::Result;
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::Response;
use crate::util::{max_age_seconds, sha256_hex};

const APP_VERSION: u32 = 1;
const ENTRY_COUNT: usize = 2;
const ENTRY_METADATA: usize = 0;
const ENTRY_BODY: usize = 1;

/// The response store backing the cache pipeline stage: a two-slot
/// [`DiskCache`] keyed by the SHA-256 of the request URL. Slot 0 holds the
/// serialized status line and headers, slot 1 the raw body.
pub struct HttpCache {
    store: DiskCache,
}

impl HttpCache {
    pub fn open(directory: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        Ok(Self {
            store: DiskCache::open(directory, APP_VERSION, ENTRY_COUNT, max_size)?,
        })
    }

    /// The underlying store, for maintenance (size, eviction, closing).
    pub fn store(&self) -> &DiskCache {
        &self.store
    }

    pub fn key_for(url: &Url) -> String {
        sha256_hex(url.as_str())
    }
}

/// Whether a success under this method makes a cached GET for the same URL
/// untrustworthy.
fn invalidates_cache(method: &Method) -> bool {
    matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE" | "MOVE")
}

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    stored_at: u64,
    body: ResponseBody,
}

impl CachedResponse {
    fn is_fresh(&self, now: u64) -> bool {
        let Some(max_age) = self
            .headers
            .get("cache-control")
            .and_then(|value| value.to_str().ok())
            .and_then(max_age_seconds)
        else {
            return false;
        };
        now.saturating_sub(self.stored_at) < max_age
    }
}

/// Pipeline stage that answers GETs from disk when a fresh copy exists and
/// writes successful GET responses through as their bodies are consumed.
/// Cache failures of any kind degrade to normal network behavior; they
/// never fail the call.
pub(crate) struct CacheInterceptor {
    cache: std::sync::Arc<HttpCache>,
    serve_stale: bool,
}

impl CacheInterceptor {
    pub(crate) fn new(cache: std::sync::Arc<HttpCache>, serve_stale: bool) -> Self {
        Self { cache, serve_stale }
    }

    fn lookup(&self, request: &Request) -> Option<CachedResponse> {
        let key = HttpCache::key_for(request.url());
        let mut snapshot = match self.cache.store.get(&key) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(error) => {
                debug!(error = %error, "cache lookup failed");
                return None;
            }
        };
        match read_cached_response(request, &mut snapshot) {
            Ok(cached) => cached,
            Err(error) => {
                debug!(error = %error, "cached entry unreadable");
                None
            }
        }
    }

    fn write_through(&self, response: &mut Response) {
        let key = HttpCache::key_for(response.request().url());
        let editor = match self.cache.store.edit(&key) {
            Ok(Some(editor)) => editor,
            Ok(None) => return,
            Err(error) => {
                debug!(error = %error, "cache edit refused");
                return;
            }
        };
        if let Err(error) = start_cache_write(response, editor) {
            debug!(error = %error, "cache write failed to start");
        }
    }

    fn invalidate(&self, request: &Request) {
        let key = HttpCache::key_for(request.url());
        if let Err(error) = self.cache.store.remove(&key) {
            debug!(error = %error, "cache invalidation failed");
        }
    }
}

impl Interceptor for CacheInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let request = chain.request().clone();

        if request.method() != Method::GET {
            let invalidates = invalidates_cache(request.method());
            let response = chain.proceed(request)?;
            if invalidates && response.is_success() {
                self.invalidate(response.request());
            }
            return Ok(response);
        }

        if let Some(cached) = self.lookup(&request) {
            let now = now_epoch_seconds();
            if cached.is_fresh(now) {
                return cached_hit(&request, cached, false);
            }
            if self.serve_stale {
                return cached_hit(&request, cached, true);
            }
        }

        let mut response = chain.proceed(request)?;
        if response.is_success() && response.body().is_some() {
            self.write_through(&mut response);
        }
        Ok(response)
    }
}

fn cached_hit(request: &Request, cached: CachedResponse, intermediate: bool) -> Result<Response> {
    Ok(Response::builder()
        .request(request.clone())
        .status(cached.status)
        .headers(cached.headers)
        .body(cached.body)
        .intermediate(intermediate)
        .build()?)
}

/// Deserializes the metadata slot and opens the body slot. `Ok(None)` for
/// entries that belong to a different URL (a digest collision).
fn read_cached_response(
    request: &Request,
    snapshot: &mut Snapshot,
) -> io::Result<Option<CachedResponse>> {
    let mut metadata = String::new();
    snapshot
        .take_reader(ENTRY_METADATA)
        .ok_or_else(|| io::Error::other("metadata slot already taken"))?
        .read_to_string(&mut metadata)?;
    let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed cache metadata");

    let mut lines = metadata.lines();
    let url = lines.next().ok_or_else(malformed)?;
    if url != request.url().as_str() {
        return Ok(None);
    }
    let method = lines.next().ok_or_else(malformed)?;
    if method != request.method().as_str() {
        return Ok(None);
    }
    let status: u16 = lines
        .next()
        .and_then(|line| line.parse().ok())
        .ok_or_else(malformed)?;
    let status = StatusCode::from_u16(status).map_err(|_| malformed())?;
    let stored_at: u64 = lines
        .next()
        .and_then(|line| line.parse().ok())
        .ok_or_else(malformed)?;
    let header_count: usize = lines
        .next()
        .and_then(|line| line.parse().ok())
        .ok_or_else(malformed)?;

    let mut headers = HeaderMap::new();
    for _ in 0..header_count {
        let line = lines.next().ok_or_else(malformed)?;
        let (name, value) = line.split_once(": ").ok_or_else(malformed)?;
        let name: http::header::HeaderName = name.parse().map_err(|_| malformed())?;
        let value = http::header::HeaderValue::from_str(value).map_err(|_| malformed())?;
        headers.append(name, value);
    }

    let length = snapshot.length(ENTRY_BODY);
    let body_file = snapshot
        .take_reader(ENTRY_BODY)
        .ok_or_else(|| io::Error::other("body slot already taken"))?;
    Ok(Some(CachedResponse {
        status,
        headers,
        stored_at,
        body: ResponseBody::from_reader(body_file, Some(length)),
    }))
}

/// Writes the metadata slot now and swaps the response body for a tee that
/// copies into the body slot as the caller reads, committing at EOF.
fn start_cache_write(response: &mut Response, mut editor: Editor) -> Result<()> {
    let mut metadata = editor.new_sink(ENTRY_METADATA)?;
    write_metadata(&mut metadata, response)?;
    metadata.flush()?;
    drop(metadata);

    let body_sink = editor.new_sink(ENTRY_BODY)?;
    response.map_body(|body| {
        let length = body.length();
        ResponseBody::from_reader(
            CacheWritingReader {
                inner: body,
                sink: Some(body_sink),
                editor: Some(editor),
            },
            length,
        )
    });
    Ok(())
}

fn write_metadata(sink: &mut dyn Write, response: &Response) -> io::Result<()> {
    let request = response.request();
    let storable: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_owned(), value.to_owned()))
        })
        .collect();
    writeln!(sink, "{}", request.url().as_str())?;
    writeln!(sink, "{}", request.method().as_str())?;
    writeln!(sink, "{}", response.status().as_u16())?;
    writeln!(sink, "{}", now_epoch_seconds())?;
    writeln!(sink, "{}", storable.len())?;
    for (name, value) in storable {
        writeln!(sink, "{name}: {value}")?;
    }
    Ok(())
}

/// Tees a response body into a cache editor. EOF commits the entry;
/// dropping the reader early aborts the edit through the editor's own
/// drop, leaving the cache without a partial value.
struct CacheWritingReader {
    inner: ResponseBody,
    sink: Option<Box<dyn Write + Send>>,
    editor: Option<Editor>,
}

impl Read for CacheWritingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read == 0 {
            if let Some(mut sink) = self.sink.take() {
                if let Err(error) = sink.flush() {
                    debug!(error = %error, "cache body flush failed");
                    self.editor.take();
                    return Ok(0);
                }
            }
            if let Some(editor) = self.editor.take() {
                if let Err(error) = editor.commit() {
                    debug!(error = %error, "cache commit failed");
                }
            }
            return Ok(0);
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(error) = sink.write_all(&buf[..read]) {
                // Stop caching this response; keep serving the caller.
                debug!(error = %error, "cache body write failed");
                self.sink = None;
                if let Some(editor) = self.editor.take() {
                    editor.abort();
                }
            }
        }
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;

    use http::{Method, StatusCode};

    use super::{invalidates_cache, CacheInterceptor, HttpCache};
    use crate::body::ResponseBody;
    use crate::error::Result;
    use crate::interceptor::{Chain, Interceptor};
    use crate::request::Request;
    use crate::response::Response;

    struct CannedNetwork {
        status: StatusCode,
        cache_control: Option<&'static str>,
        body: &'static str,
        hits: std::sync::atomic::AtomicUsize,
    }

    impl Interceptor for CannedNetwork {
        fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
            self.hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut builder = Response::builder()
                .request(chain.request().clone())
                .status(self.status)
                .body(ResponseBody::buffered(self.body));
            if let Some(cache_control) = self.cache_control {
                builder = builder.header("cache-control", cache_control)?;
            }
            builder.build()
        }
    }

    fn run(
        cache: &Arc<HttpCache>,
        serve_stale: bool,
        network: &Arc<CannedNetwork>,
        request: Request,
    ) -> Response {
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(CacheInterceptor::new(Arc::clone(cache), serve_stale)),
            Arc::clone(network) as Arc<dyn Interceptor>,
        ];
        let mut chain = Chain::new(&interceptors, request.clone());
        chain.proceed(request).expect("response")
    }

    fn drain(response: &mut Response) -> String {
        let body = response.take_body().expect("body");
        let bytes = body.read_to_bytes().expect("read");
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    #[test]
    fn a_fresh_hit_skips_the_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(HttpCache::open(dir.path(), 1 << 20).expect("cache"));
        let network = Arc::new(CannedNetwork {
            status: StatusCode::OK,
            cache_control: Some("max-age=60"),
            body: "payload",
            hits: std::sync::atomic::AtomicUsize::new(0),
        });
        let request = Request::get("http://example.com/data").expect("request");

        let mut first = run(&cache, false, &network, request.clone());
        assert_eq!(drain(&mut first), "payload");
        drop(first);

        let mut second = run(&cache, false, &network, request);
        assert_eq!(drain(&mut second), "payload");
        assert!(!second.is_intermediate());
        assert_eq!(second.header("cache-control"), Some("max-age=60"));
        assert_eq!(network.hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn an_unconsumed_body_is_not_cached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(HttpCache::open(dir.path(), 1 << 20).expect("cache"));
        let network = Arc::new(CannedNetwork {
            status: StatusCode::OK,
            cache_control: Some("max-age=60"),
            body: "payload",
            hits: std::sync::atomic::AtomicUsize::new(0),
        });
        let request = Request::get("http://example.com/data").expect("request");

        // Dropped without reading to EOF: the edit aborts.
        let first = run(&cache, false, &network, request.clone());
        drop(first);

        let mut second = run(&cache, false, &network, request);
        assert_eq!(drain(&mut second), "payload");
        assert_eq!(network.hits.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn a_stale_hit_is_served_intermediate_only_on_opt_in() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(HttpCache::open(dir.path(), 1 << 20).expect("cache"));
        let network = Arc::new(CannedNetwork {
            status: StatusCode::OK,
            cache_control: Some("max-age=0"),
            body: "payload",
            hits: std::sync::atomic::AtomicUsize::new(0),
        });
        let request = Request::get("http://example.com/data").expect("request");

        let mut first = run(&cache, false, &network, request.clone());
        drain(&mut first);
        drop(first);
        // The entry commits when the body hits EOF on this thread, so it is
        // visible immediately.

        let mut opted_in = run(&cache, true, &network, request.clone());
        assert!(opted_in.is_intermediate());
        assert_eq!(drain(&mut opted_in), "payload");
        assert_eq!(network.hits.load(std::sync::atomic::Ordering::SeqCst), 1);

        let mut opted_out = run(&cache, false, &network, request);
        assert!(!opted_out.is_intermediate());
        drain(&mut opted_out);
        assert_eq!(network.hits.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn success_under_a_mutating_method_invalidates_the_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(HttpCache::open(dir.path(), 1 << 20).expect("cache"));
        let network = Arc::new(CannedNetwork {
            status: StatusCode::OK,
            cache_control: Some("max-age=60"),
            body: "payload",
            hits: std::sync::atomic::AtomicUsize::new(0),
        });
        let get = Request::get("http://example.com/data").expect("request");
        let mut primed = run(&cache, false, &network, get.clone());
        drain(&mut primed);
        drop(primed);

        let post = Request::builder()
            .url_str("http://example.com/data")
            .expect("url")
            .method(Method::POST)
            .build()
            .expect("request");
        let mut posted = run(&cache, false, &network, post);
        drain(&mut posted);
        drop(posted);

        let mut after = run(&cache, false, &network, get);
        drain(&mut after);
        assert_eq!(network.hits.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn invalidating_methods_are_the_unsafe_ones() {
        assert!(invalidates_cache(&Method::POST));
        assert!(invalidates_cache(&Method::PUT));
        assert!(invalidates_cache(&Method::DELETE));
        assert!(invalidates_cache(&Method::PATCH));
        assert!(!invalidates_cache(&Method::GET));
        assert!(!invalidates_cache(&Method::HEAD));
    }
}
