//! Asynchronous HTTP client abstraction.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;

/// A boxed stream type for HTTP response bodies.
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// Minimal streaming interface the engines and the mirror tester need.
///
/// Implementations handle their own redirect following and error
/// mapping. Returning from [`HttpClient::stream`] means the response
/// headers have arrived; the elapsed time up to that point is what the
/// mirror tester uses as connection latency.
///
/// # Implementations
///
/// - [`ReqwestClient`]: production implementation using `reqwest`
/// - Mock implementations for testing
pub trait HttpClient: Send + Sync {
    /// Error type for HTTP operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a streaming GET and return the response body as a stream.
    ///
    /// Non-success status codes are errors; a `Range` header in
    /// `headers` requests a partial body.
    fn stream(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> impl Future<
        Output = std::result::Result<
            BoxStream<'static, std::result::Result<Bytes, Self::Error>>,
            Self::Error,
        >,
    > + Send;
}

impl<T: HttpClient> HttpClient for std::sync::Arc<T> {
    type Error = T::Error;

    async fn stream(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> std::result::Result<BoxStream<'static, std::result::Result<Bytes, Self::Error>>, Self::Error>
    {
        (**self).stream(url, headers).await
    }
}

#[cfg(feature = "reqwest")]
mod reqwest_impl {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    /// Production HTTP client implementation using reqwest.
    #[derive(Clone)]
    pub struct ReqwestClient {
        client: reqwest::Client,
    }

    impl ReqwestClient {
        /// Build a client tuned for long streaming transfers: connect
        /// timeout only, no overall request deadline.
        pub fn new(user_agent: &str, connect_timeout: Duration) -> reqwest::Result<Self> {
            let client = reqwest::Client::builder()
                .user_agent(user_agent)
                .connect_timeout(connect_timeout)
                .pool_max_idle_per_host(8)
                .build()?;
            Ok(Self { client })
        }

        pub fn from_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    impl HttpClient for ReqwestClient {
        type Error = reqwest::Error;

        async fn stream(
            &self,
            url: &str,
            headers: &[(String, String)],
        ) -> std::result::Result<BoxStream<'static, std::result::Result<Bytes, Self::Error>>, Self::Error>
        {
            let mut request = self.client.get(url);
            for (key, value) in headers {
                request = request.header(key, value);
            }

            let response = request.send().await?.error_for_status()?;
            let stream = response.bytes_stream().map(|result| result.map(Bytes::from));

            Ok(Box::pin(stream))
        }
    }
}

#[cfg(feature = "reqwest")]
pub use reqwest_impl::ReqwestClient;
