//! [`TransactionApi`] over the transaction service's REST endpoints.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | list      | `GET /transaction?skip={skip}&take={take}` |
//! | aggregate | `GET /transaction/aggregated` |
//! | create    | `POST /transaction` |
//! | update    | `PATCH /transaction/{id}` |
//! | delete    | `DELETE /transaction/{id}` |

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ledger_core::{QueryError, Summary, Transaction, TransactionApi, TransactionPatch};
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;

const RESOURCE: &str = "transaction";

/// HTTP client for the transaction service.
#[derive(Debug, Clone)]
pub struct HttpTransactionApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTransactionApi {
    /// Creates a client for the service at `base_url`. `timeout` bounds each
    /// request end to end.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute http(s) URL or the
    /// underlying client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .with_context(|| format!("invalid base url {base_url:?}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("base url {base_url} cannot carry a path");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client, base_url })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/transaction/{segments...}` with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(RESOURCE).extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.client.request(method, self.url(segments))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, QueryError> {
        let (status, body) = self.send_raw(request).await?;
        serde_json::from_slice(&body).map_err(|err| QueryError::Server {
            status,
            message: format!("malformed response body: {err}"),
        })
    }

    /// Sends `request` and returns the status and body of a successful response.
    async fn send_raw(&self, request: RequestBuilder) -> Result<(u16, Vec<u8>), QueryError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;
        if status.is_success() {
            Ok((status.as_u16(), body.to_vec()))
        } else {
            Err(status_error(status.as_u16(), &String::from_utf8_lossy(&body)))
        }
    }
}

fn transport_error(err: reqwest::Error) -> QueryError {
    if err.is_timeout() {
        QueryError::Network(format!("request timed out: {err}"))
    } else {
        QueryError::Network(err.to_string())
    }
}

/// Classifies a non-success response. Codes outside 4xx and 5xx count as
/// server failures.
fn status_error(status: u16, body: &str) -> QueryError {
    let message = if body.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        body.trim().to_string()
    };
    QueryError::from_status(status, message.clone()).unwrap_or(QueryError::Server { status, message })
}

#[async_trait]
impl TransactionApi for HttpTransactionApi {
    async fn list(&self, skip: usize, take: usize) -> Result<Vec<Transaction>, QueryError> {
        tracing::debug!(skip, take, "GET transaction page");
        self.send(self.request(Method::GET, &[]).query(&[("skip", skip), ("take", take)]))
            .await
    }

    async fn aggregate(&self) -> Result<Summary, QueryError> {
        self.send(self.request(Method::GET, &["aggregated"])).await
    }

    async fn create(&self, transaction: &Transaction) -> Result<Transaction, QueryError> {
        self.send(self.request(Method::POST, &[]).json(transaction)).await
    }

    async fn update(&self, id: &str, patch: &TransactionPatch) -> Result<Transaction, QueryError> {
        self.send(self.request(Method::PATCH, &[id]).json(patch)).await
    }

    async fn delete(&self, id: &str) -> Result<(), QueryError> {
        self.send_raw(self.request(Method::DELETE, &[id])).await.map(|_| ())
    }
}
