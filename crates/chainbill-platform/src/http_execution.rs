use async_trait::async_trait;
use chainbill_tools::{DelegationProof, ExecutionError, ExecutionPayload, ExecutionService};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    proof: &'a DelegationProof,
    payload: &'a ExecutionPayload,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    transaction_ref: String,
}

/// Execution service reached over JSON/HTTP. The caller owns the deadline; this client only
/// classifies what came back.
#[derive(Clone)]
pub struct HttpExecutionService {
    client: Client,
    endpoint: String,
}

impl HttpExecutionService {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/v1/transfers", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Client errors mean the transfer itself was refused; anything else may succeed later.
fn classify(status: StatusCode, body: String) -> ExecutionError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    if status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        ExecutionError::Rejected(detail)
    } else {
        ExecutionError::Unavailable(detail)
    }
}

#[async_trait]
impl ExecutionService for HttpExecutionService {
    async fn submit(
        &self,
        proof: &DelegationProof,
        payload: &ExecutionPayload,
    ) -> Result<String, ExecutionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", &payload.idempotency_key)
            .json(&TransferRequest { proof, payload })
            .send()
            .await
            .map_err(|err| ExecutionError::Unavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify(status, body);
            warn!("transfer {} not executed: {err}", payload.idempotency_key);
            return Err(err);
        }

        let body: TransferResponse = response.json().await.map_err(|err| {
            ExecutionError::Unavailable(format!("unreadable execution response: {err}"))
        })?;
        Ok(body.transaction_ref)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(StatusCode::UNPROCESSABLE_ENTITY, true)]
    #[case(StatusCode::PAYMENT_REQUIRED, true)]
    #[case(StatusCode::FORBIDDEN, true)]
    #[case(StatusCode::TOO_MANY_REQUESTS, false)]
    #[case(StatusCode::REQUEST_TIMEOUT, false)]
    #[case(StatusCode::BAD_GATEWAY, false)]
    #[case(StatusCode::SERVICE_UNAVAILABLE, false)]
    fn statuses_are_classified(#[case] status: StatusCode, #[case] rejected: bool) {
        let err = classify(status, "insufficient balance".to_string());

        assert_eq!(matches!(err, ExecutionError::Rejected(_)), rejected);
        assert!(err.to_string().contains("insufficient balance"));
    }

    #[rstest]
    fn endpoint_ignores_trailing_slash() {
        let service = HttpExecutionService::new("http://execution:8080/");

        assert_eq!(service.endpoint(), "http://execution:8080/v1/transfers");
    }
}
