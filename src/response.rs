use http::{HeaderMap, StatusCode};

use crate::body::ResponseBody;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::route::Route;
use crate::util::header_str;

/// An HTTP response. Carries the request that produced it (after any
/// normalization), the route it was served over when it came off the wire,
/// and the body-less responses of earlier attempts in a follow-up sequence.
#[derive(Debug)]
pub struct Response {
    request: Request,
    status: StatusCode,
    headers: HeaderMap,
    body: Option<ResponseBody>,
    route: Option<Route>,
    prior_response: Option<Box<Response>>,
    /// True for a cache hit served while the entry still needs a refresh.
    intermediate: bool,
}

impl Response {
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder::default()
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&mut self) -> Option<&mut ResponseBody> {
        self.body.as_mut()
    }

    pub fn take_body(&mut self) -> Option<ResponseBody> {
        self.body.take()
    }

    /// Closes the body stream, releasing any connection resources it holds.
    pub fn close_body(&mut self) {
        self.body = None;
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    pub fn is_intermediate(&self) -> bool {
        self.intermediate
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub(crate) fn set_prior_response(&mut self, mut prior: Response) {
        prior.close_body();
        self.prior_response = Some(Box::new(prior));
    }

    pub(crate) fn map_body(&mut self, map: impl FnOnce(ResponseBody) -> ResponseBody) {
        if let Some(body) = self.body.take() {
            self.body = Some(map(body));
        }
    }

    pub(crate) fn into_builder(self) -> ResponseBuilder {
        ResponseBuilder {
            request: Some(self.request),
            status: Some(self.status),
            headers: self.headers,
            body: self.body,
            route: self.route,
            intermediate: self.intermediate,
        }
    }
}

#[derive(Debug, Default)]
pub struct ResponseBuilder {
    request: Option<Request>,
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Option<ResponseBody>,
    route: Option<Route>,
    intermediate: bool,
}

impl ResponseBuilder {
    pub fn request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name: http::header::HeaderName = name
            .parse()
            .map_err(|_| Error::protocol(format!("invalid header name: {name}")))?;
        let value = http::header::HeaderValue::from_str(value)
            .map_err(|_| Error::protocol(format!("invalid header value for {name}")))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.route = Some(route);
        self
    }

    pub fn intermediate(mut self, intermediate: bool) -> Self {
        self.intermediate = intermediate;
        self
    }

    pub fn build(self) -> Result<Response> {
        let request = self
            .request
            .ok_or_else(|| Error::protocol("response is missing its request"))?;
        let status = self
            .status
            .ok_or_else(|| Error::protocol("response is missing a status"))?;
        Ok(Response {
            request,
            status,
            headers: self.headers,
            body: self.body,
            route: self.route,
            prior_response: None,
            intermediate: self.intermediate,
        })
    }
}
