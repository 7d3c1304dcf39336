use std::sync::Arc;

use crate::connection::{Allocation, Connection};
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;

/// One pipeline stage. An interceptor observes or rewrites the request,
/// calls [`Chain::proceed`] to hand off to the next stage, and observes or
/// rewrites the response on the way back out. The terminal stage answers
/// without proceeding.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response>;
}

/// The carrier threaded through the pipeline. Each stage sees a chain
/// positioned at its own index; proceeding builds a child chain at the next
/// index and counts the call so contract violations surface as
/// [`Error::Protocol`] instead of corrupting connection state.
pub struct Chain<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    index: usize,
    request: Request,
    allocation: Option<Arc<Allocation>>,
    calls: u32,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(interceptors: &'a [Arc<dyn Interceptor>], request: Request) -> Self {
        Self {
            interceptors,
            index: 0,
            request,
            allocation: None,
            calls: 0,
        }
    }

    /// The request as it stands at this stage.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn allocation(&self) -> Option<&Arc<Allocation>> {
        self.allocation.as_ref()
    }

    /// The live connection, available to network stages.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.allocation.as_ref().and_then(|a| a.connection())
    }

    fn exchange_live(&self) -> bool {
        self.allocation
            .as_ref()
            .is_some_and(|allocation| allocation.codec_in_use())
    }

    /// Hands `request` to the next stage and returns its response.
    pub fn proceed(&mut self, request: Request) -> Result<Response> {
        self.calls += 1;

        if self.exchange_live() {
            // With an exchange underway the target is already fixed.
            if let Some(connection) = self.connection() {
                let route_address = connection.route().address();
                if request.host() != route_address.host()
                    || request.port() != route_address.port()
                {
                    return Err(Error::protocol(format!(
                        "network stage {} must retain the same host and port",
                        self.index.saturating_sub(1),
                    )));
                }
            }
            if self.calls > 1 {
                return Err(Error::protocol(format!(
                    "network stage {} must call proceed() exactly once",
                    self.index.saturating_sub(1),
                )));
            }
        }

        let Some(interceptor) = self.interceptors.get(self.index) else {
            return Err(Error::protocol(
                "proceed() called past the end of the pipeline",
            ));
        };

        let exchange_was_live = self.exchange_live();
        let mut child = Chain {
            interceptors: self.interceptors,
            index: self.index + 1,
            request,
            allocation: self.allocation.clone(),
            calls: 0,
        };
        let response = interceptor.intercept(&mut child)?;

        // A network stage that never proceeded, or proceeded twice, left
        // the exchange in an unknown state.
        if exchange_was_live && child.index < self.interceptors.len() && child.calls != 1 {
            return Err(Error::protocol(format!(
                "network stage {} must call proceed() exactly once",
                child.index - 1,
            )));
        }
        Ok(response)
    }

    /// Installs the per-call connection bookkeeping before proceeding. Only
    /// the retry stage does this; every stage below inherits the handle.
    pub(crate) fn proceed_with(
        &mut self,
        request: Request,
        allocation: Arc<Allocation>,
    ) -> Result<Response> {
        self.allocation = Some(allocation);
        self.proceed(request)
    }
}
