use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use url::Url;

use crate::body::Body;
use crate::error::{Error, Result};
use crate::util::header_str;

/// An immutable HTTP request. Header insertion order is preserved and
/// duplicate names are kept; follow-ups derive modified copies through
/// [`Request::into_builder`].
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Body,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::builder().url_str(url)?.build()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    pub fn into_builder(self) -> RequestBuilder {
        RequestBuilder {
            method: self.method,
            url: Some(self.url),
            headers: self.headers,
            body: self.body,
        }
    }
}

#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    url: Option<Url>,
    headers: HeaderMap,
    body: Body,
}

impl RequestBuilder {
    fn new() -> Self {
        Self {
            method: Method::GET,
            url: None,
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }

    pub fn url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn url_str(mut self, url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|_| Error::InvalidUrl {
            url: url.to_owned(),
        })?;
        self.url = Some(parsed);
        Ok(self)
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Appends a header, preserving any existing values under `name`.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name: HeaderName = name
            .parse()
            .map_err(|_| Error::protocol(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::protocol(format!("invalid header value for {name}")))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Replaces all values under `name`.
    pub fn set_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name: HeaderName = name
            .parse()
            .map_err(|_| Error::protocol(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::protocol(format!("invalid header value for {name}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn remove_header(mut self, name: &str) -> Self {
        if let Ok(name) = name.parse::<HeaderName>() {
            self.headers.remove(&name);
        }
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<Request> {
        let url = self.url.ok_or_else(|| Error::InvalidUrl {
            url: String::new(),
        })?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::InvalidUrl {
                    url: format!("{other}://…"),
                });
            }
        }
        if url.host_str().is_none() {
            return Err(Error::InvalidUrl {
                url: url.to_string(),
            });
        }
        Ok(Request {
            method: self.method,
            url,
            headers: self.headers,
            body: self.body,
        })
    }
}
