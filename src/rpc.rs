//! JSON-RPC ledger client.
//!
//! Implements [`Ledger`] over plain HTTP JSON-RPC. Transactions travel
//! base64-encoded; confirmation polls `getSignatureStatuses` until the
//! configured commitment is reached, the transaction errors, its blockhash
//! expires, or the confirmation timeout runs out.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::bundle::SignedBundle;
use crate::ledger::{Ledger, LedgerError, Simulation};
use crate::types::{Blockhash, Signature};

const DEFAULT_STATUS_POLL: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn commitment_rank(level: &str) -> u8 {
    match level {
        "processed" => 0,
        "confirmed" => 1,
        "finalized" => 2,
        _ => 1,
    }
}

pub struct RpcLedger {
    http: Client,
    url: String,
    commitment: String,
    confirm_timeout: Duration,
    status_poll: Duration,
}

impl RpcLedger {
    pub fn new(url: &str, commitment: &str, confirm_timeout: Duration) -> Result<Self, LedgerError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            url: url.to_string(),
            commitment: commitment.to_string(),
            confirm_timeout,
            status_poll: DEFAULT_STATUS_POLL,
        })
    }

    pub fn with_status_poll(mut self, interval: Duration) -> Self {
        self.status_poll = interval;
        self
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp: Value = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| LedgerError::Malformed(e.to_string()))?;

        if let Some(error) = resp.get("error") {
            return Err(rpc_error(error));
        }
        resp.get("result")
            .cloned()
            .ok_or_else(|| LedgerError::Malformed(format!("{method}: no result")))
    }

    // poll failures are not fatal here: the transaction is already out, so
    // the only safe answers are confirmed, failed, expired, or unconfirmed
    async fn confirm(&self, signature: &Signature, blockhash: &Blockhash) -> Result<(), LedgerError> {
        let target = commitment_rank(&self.commitment);
        let deadline = Instant::now() + self.confirm_timeout;
        let mut last_error = None;

        loop {
            match self.signature_status(signature).await {
                Ok(Value::Null) => match self.is_blockhash_valid(blockhash).await {
                    // never landed and can no longer land
                    Ok(false) => return Err(LedgerError::Transaction("block height exceeded".to_string())),
                    Ok(true) => {}
                    Err(e) => last_error = Some(e),
                },
                Ok(status) => {
                    if let Some(err) = status.get("err").filter(|e| !e.is_null()) {
                        return Err(LedgerError::Transaction(err.to_string()));
                    }
                    let reached = status
                        .get("confirmationStatus")
                        .and_then(Value::as_str)
                        .map(commitment_rank)
                        .unwrap_or(0);
                    if reached >= target {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(signature = %signature, error = %e, "status poll failed");
                    last_error = Some(e);
                }
            }

            if Instant::now() >= deadline {
                let reason = match last_error {
                    Some(e) => format!("confirmation timed out, last poll error: {e}"),
                    None => "confirmation timed out".to_string(),
                };
                return Err(LedgerError::Unconfirmed {
                    signature: Some(signature.clone()),
                    reason,
                });
            }
            sleep(self.status_poll).await;
        }
    }

    async fn signature_status(&self, signature: &Signature) -> Result<Value, LedgerError> {
        let result = self
            .call(
                "getSignatureStatuses",
                json!([[signature.0], { "searchTransactionHistory": false }]),
            )
            .await?;
        Ok(result.pointer("/value/0").cloned().unwrap_or(Value::Null))
    }
}

// preflight failures carry the program error and logs in `data`
fn rpc_error(error: &Value) -> LedgerError {
    let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();

    let mut detail = Vec::new();
    if let Some(data) = error.get("data") {
        if let Some(err) = data.get("err").filter(|e| !e.is_null()) {
            detail.push(err.to_string());
        }
        if let Some(logs) = data.get("logs").and_then(Value::as_array) {
            detail.extend(logs.iter().filter_map(Value::as_str).map(str::to_string));
        }
    }

    LedgerError::Rpc {
        code,
        message,
        detail: detail.join(" | "),
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn latest_blockhash(&self) -> Result<Blockhash, LedgerError> {
        let result = self
            .call("getLatestBlockhash", json!([{ "commitment": self.commitment }]))
            .await?;
        result
            .pointer("/value/blockhash")
            .and_then(Value::as_str)
            .map(|b| Blockhash(b.to_string()))
            .ok_or_else(|| LedgerError::Malformed("getLatestBlockhash: missing blockhash".to_string()))
    }

    async fn is_blockhash_valid(&self, blockhash: &Blockhash) -> Result<bool, LedgerError> {
        let result = self
            .call(
                "isBlockhashValid",
                json!([blockhash.0, { "commitment": self.commitment }]),
            )
            .await?;
        result
            .get("value")
            .and_then(Value::as_bool)
            .ok_or_else(|| LedgerError::Malformed("isBlockhashValid: missing value".to_string()))
    }

    async fn simulate(&self, bundle: &SignedBundle) -> Result<Simulation, LedgerError> {
        let encoded = STANDARD.encode(&bundle.bytes);
        let result = self
            .call(
                "simulateTransaction",
                json!([encoded, {
                    "encoding": "base64",
                    "sigVerify": false,
                    "replaceRecentBlockhash": true,
                    "commitment": self.commitment,
                }]),
            )
            .await?;

        let value = result
            .get("value")
            .ok_or_else(|| LedgerError::Malformed("simulateTransaction: missing value".to_string()))?;
        let logs = value
            .get("logs")
            .and_then(Value::as_array)
            .map(|logs| logs.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Simulation {
            units_consumed: value.get("unitsConsumed").and_then(Value::as_u64).unwrap_or(0),
            error: value.get("err").filter(|e| !e.is_null()).map(Value::to_string),
            logs,
        })
    }

    async fn send_and_confirm(&self, bundle: &SignedBundle) -> Result<Signature, LedgerError> {
        let encoded = STANDARD.encode(&bundle.bytes);
        let result = self
            .call(
                "sendTransaction",
                json!([encoded, {
                    "encoding": "base64",
                    "preflightCommitment": self.commitment,
                }]),
            )
            .await
            .map_err(|e| match e {
                // the request may have reached the node before the connection dropped
                LedgerError::Transport(reason) => LedgerError::Unconfirmed { signature: None, reason },
                other => other,
            })?;
        let signature = result
            .as_str()
            .map(|s| Signature(s.to_string()))
            .ok_or_else(|| LedgerError::Malformed("sendTransaction: missing signature".to_string()))?;

        debug!(signature = %signature, bytes = bundle.size(), "sent, awaiting confirmation");
        self.confirm(&signature, &bundle.blockhash).await?;
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bundle() -> SignedBundle {
        SignedBundle {
            bytes: vec![1, 2, 3],
            blockhash: Blockhash("hash".to_string()),
            compute_unit_limit: 1_400_000,
            operations: Vec::new(),
            account_count: 0,
        }
    }

    async fn ledger(server: &MockServer) -> RpcLedger {
        RpcLedger::new(&server.uri(), "confirmed", Duration::from_secs(2))
            .unwrap()
            .with_status_poll(Duration::from_millis(10))
    }

    async fn mock_result(server: &MockServer, rpc_method: &str, result: Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": rpc_method })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": result,
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn fetches_latest_blockhash() {
        let server = MockServer::start().await;
        mock_result(
            &server,
            "getLatestBlockhash",
            json!({ "context": { "slot": 1 }, "value": { "blockhash": "abc", "lastValidBlockHeight": 10 } }),
        )
        .await;

        let blockhash = ledger(&server).await.latest_blockhash().await.unwrap();
        assert_eq!(blockhash, Blockhash("abc".to_string()));
    }

    #[tokio::test]
    async fn simulation_reports_units_and_error() {
        let server = MockServer::start().await;
        mock_result(
            &server,
            "simulateTransaction",
            json!({ "context": { "slot": 1 }, "value": {
                "err": { "InstructionError": [0, { "Custom": 6000 }] },
                "logs": ["Program log: Error Number: 6000"],
                "unitsConsumed": 123456
            }}),
        )
        .await;

        let sim = ledger(&server).await.simulate(&bundle()).await.unwrap();
        assert_eq!(sim.units_consumed, 123456);
        assert!(sim.error_detail().unwrap().contains("Error Number: 6000"));
    }

    #[tokio::test]
    async fn preflight_error_keeps_logs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "sendTransaction" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {
                    "code": -32002,
                    "message": "Transaction simulation failed: Blockhash not found",
                    "data": { "err": "BlockhashNotFound", "logs": [] }
                }
            })))
            .mount(&server)
            .await;

        let err = ledger(&server).await.send_and_confirm(&bundle()).await.unwrap_err();
        match err {
            LedgerError::Rpc { code, message, detail } => {
                assert_eq!(code, -32002);
                assert!(message.contains("Blockhash not found"));
                assert!(detail.contains("BlockhashNotFound"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn confirms_at_commitment() {
        let server = MockServer::start().await;
        mock_result(&server, "sendTransaction", json!("sig123")).await;
        mock_result(
            &server,
            "getSignatureStatuses",
            json!({ "context": { "slot": 2 }, "value": [{ "err": null, "confirmationStatus": "confirmed" }] }),
        )
        .await;

        let signature = ledger(&server).await.send_and_confirm(&bundle()).await.unwrap();
        assert_eq!(signature, Signature("sig123".to_string()));
    }

    #[tokio::test]
    async fn failed_transaction_surfaces_program_error() {
        let server = MockServer::start().await;
        mock_result(&server, "sendTransaction", json!("sig123")).await;
        mock_result(
            &server,
            "getSignatureStatuses",
            json!({ "context": { "slot": 2 }, "value": [{
                "err": { "InstructionError": [0, { "Custom": 6000 }] },
                "confirmationStatus": "processed"
            }]}),
        )
        .await;

        let err = ledger(&server).await.send_and_confirm(&bundle()).await.unwrap_err();
        assert!(err.to_string().contains("\"Custom\":6000"));
    }

    #[tokio::test]
    async fn dropped_transaction_reports_block_height_exceeded() {
        let server = MockServer::start().await;
        mock_result(&server, "sendTransaction", json!("sig123")).await;
        mock_result(
            &server,
            "getSignatureStatuses",
            json!({ "context": { "slot": 2 }, "value": [null] }),
        )
        .await;
        mock_result(&server, "isBlockhashValid", json!({ "context": { "slot": 2 }, "value": false })).await;

        let err = ledger(&server).await.send_and_confirm(&bundle()).await.unwrap_err();
        assert_eq!(err, LedgerError::Transaction("block height exceeded".to_string()));
    }

    #[tokio::test]
    async fn pending_transaction_times_out() {
        let server = MockServer::start().await;
        mock_result(&server, "sendTransaction", json!("sig123")).await;
        mock_result(
            &server,
            "getSignatureStatuses",
            json!({ "context": { "slot": 2 }, "value": [{ "err": null, "confirmationStatus": "processed" }] }),
        )
        .await;

        let ledger = RpcLedger::new(&server.uri(), "finalized", Duration::from_millis(50))
            .unwrap()
            .with_status_poll(Duration::from_millis(10));
        let err = ledger.send_and_confirm(&bundle()).await.unwrap_err();
        match err {
            LedgerError::Unconfirmed { signature, .. } => {
                assert_eq!(signature, Some(Signature("sig123".to_string())));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn status_poll_failure_keeps_polling() {
        let server = MockServer::start().await;
        mock_result(&server, "sendTransaction", json!("sig123")).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "getSignatureStatuses" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": -32005, "message": "Node is behind" }
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        mock_result(
            &server,
            "getSignatureStatuses",
            json!({ "context": { "slot": 2 }, "value": [{ "err": null, "confirmationStatus": "confirmed" }] }),
        )
        .await;

        let signature = ledger(&server).await.send_and_confirm(&bundle()).await.unwrap();
        assert_eq!(signature, Signature("sig123".to_string()));
    }

    #[tokio::test]
    async fn status_poll_failures_end_unconfirmed() {
        let server = MockServer::start().await;
        mock_result(&server, "sendTransaction", json!("sig123")).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "getSignatureStatuses" })))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let ledger = RpcLedger::new(&server.uri(), "confirmed", Duration::from_millis(50))
            .unwrap()
            .with_status_poll(Duration::from_millis(10));
        let err = ledger.send_and_confirm(&bundle()).await.unwrap_err();
        assert!(matches!(err, LedgerError::Unconfirmed { signature: Some(_), .. }));
    }
}
