//! Payout provider speaking JSON over HTTP.
//!
//! `POST <endpoint>` with the transfer instruction as the body and the
//! idempotency key repeated in an `Idempotency-Key` header. A 2xx response
//! carries `{"transfer_id": "..."}`.

use async_trait::async_trait;
use bazaar_engine::{PayoutError, PayoutProvider, TransferInstruction, TransferReceipt};

pub(crate) struct HttpPayoutProvider {
    endpoint: String,
    api_key: Option<String>,
}

impl HttpPayoutProvider {
    pub(crate) fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self { endpoint, api_key }
    }
}

/// 4xx other than timeouts and rate limits means the provider will never
/// accept this instruction as sent.
fn classify(error: ureq::Error) -> PayoutError {
    match error {
        ureq::Error::StatusCode(code)
            if (400..500).contains(&code) && code != 408 && code != 429 =>
        {
            PayoutError::Rejected(format!("http status {code}"))
        }
        other => PayoutError::Unavailable(other.to_string()),
    }
}

fn send(
    endpoint: &str,
    api_key: Option<&str>,
    instruction: &TransferInstruction,
) -> Result<TransferReceipt, PayoutError> {
    let agent = ureq::Agent::new_with_defaults();
    let mut request = agent
        .post(endpoint)
        .header("Idempotency-Key", &instruction.idempotency_key)
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        request = request.header("Authorization", &format!("Bearer {key}"));
    }
    let response = request.send_json(instruction).map_err(classify)?;
    response
        .into_body()
        .read_json::<TransferReceipt>()
        .map_err(|e| PayoutError::Unavailable(format!("unreadable provider response: {e}")))
}

#[async_trait]
impl PayoutProvider for HttpPayoutProvider {
    async fn transfer(
        &self,
        instruction: TransferInstruction,
    ) -> Result<TransferReceipt, PayoutError> {
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        // ureq is synchronous.
        tokio::task::spawn_blocking(move || send(&endpoint, api_key.as_deref(), &instruction))
            .await
            .map_err(|e| PayoutError::Unavailable(format!("transfer task failed: {e}")))?
    }
}
