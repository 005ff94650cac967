//! Retry-aware remote API client.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::error::ApiError;
use super::retry::RetryPolicy;
use super::transport::{ApiRequest, ApiResponse, Transport};

/// Executes logical calls over a [`Transport`], retrying transient failures.
///
/// - 429: wait `max(1s, Retry-After)` (1s without a usable hint) and retry
/// - 5xx / timeout: wait `n * base_delay` before retry `n` and retry
/// - any other non-2xx: fail immediately with status and body
///
/// Every retry consumes one of `max_retries`; on exhaustion the last observed
/// error is returned.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn with_retry(&self, retry: RetryPolicy) -> Self {
        Self {
            transport: self.transport.clone(),
            retry,
        }
    }

    /// Run one logical call and return the first successful response.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut retries = 0u32;

        loop {
            let delay = match self.transport.send(request).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) if response.status == 429 => {
                    let delay = self.retry.rate_limit_delay(response.retry_after());
                    if retries >= self.retry.max_retries {
                        return Err(response.into_status_error());
                    }
                    warn!(
                        url = %request.url,
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, retrying"
                    );
                    delay
                }
                Ok(response) => {
                    let err = response.into_status_error();
                    if !err.is_transient() || retries >= self.retry.max_retries {
                        return Err(err);
                    }
                    self.transient_delay(request, retries, &err)
                }
                Err(err) if err.is_transient() && retries < self.retry.max_retries => {
                    self.transient_delay(request, retries, &err)
                }
                Err(err) => return Err(err),
            };

            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }

    fn transient_delay(&self, request: &ApiRequest, retries: u32, err: &ApiError) -> Duration {
        let delay = self.retry.backoff(retries + 1);
        warn!(
            url = %request.url,
            retry = retries + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient remote failure, retrying"
        );
        delay
    }

    /// Run a call and decode its JSON body.
    pub async fn json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        let response = self.execute(request).await?;
        debug!(url = %request.url, status = response.status, "remote call succeeded");
        response.decode()
    }
}
