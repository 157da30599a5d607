//! The contract between the ingestion core and the network layer.
use std::future::Future;

use crate::Result;

/// Delivers serialized ingestion payloads to a URL.
///
/// The crate does not ship an HTTP client. Implement this trait on top of whatever client the
/// application already uses, or pass a closure:
///
/// ```
/// # use flagger::{Error, Transport};
/// fn assert_transport(_: impl Transport) {}
///
/// assert_transport(|url: String, body: String| async move {
///     println!("POST {url}: {body}");
///     Ok::<(), Error>(())
/// });
/// ```
pub trait Transport: Send + Sync + 'static {
    /// Send `body` (a JSON document) to `url`. An `Err` means the payload was not delivered and
    /// may be retried later.
    fn send(&self, url: &str, body: String) -> impl Future<Output = Result<()>> + Send;
}

impl<F, Fut> Transport for F
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    fn send(&self, url: &str, body: String) -> impl Future<Output = Result<()>> + Send {
        self(url.to_owned(), body)
    }
}

#[cfg(test)]
pub(crate) use mock::MockTransport;
