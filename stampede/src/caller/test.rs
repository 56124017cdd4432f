//! Caller for the test service, the built-in smoke-test target.

use tokio_util::sync::CancellationToken;

use super::{Error, HttpClient};

const PROTOCOL: &str = "http://";
const HOST: &str = "localhost:8090";
const PATH: &str = "/test/api";
const VERSION: &str = "/v1";

/// Calls the test service endpoints.
#[derive(Debug)]
pub struct TestCaller {
    url_base: String,
    client: HttpClient,
}

impl TestCaller {
    /// Create a caller bound to the test service base URL.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self {
            url_base: format!("{PROTOCOL}{HOST}{PATH}"),
            client,
        }
    }

    /// Issue the test request.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub async fn test(&self, ctx: &CancellationToken) -> Result<(), Error> {
        self.client
            .request()
            .path(&format!("{base}{VERSION}/test", base = self.url_base), &[])
            .get(ctx)
            .await?;

        Ok(())
    }
}
