use crate::client_trait::{BlockHeader, ChainAccount, ChainAccountKey, ChainClient, ChainEvent};
use crate::error::{IndexerError, IndexerResult};
use crate::models::Address;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Chain client over the access node's HTTP API.
///
/// Script sources and arguments travel base64-encoded; event payloads and
/// script results come back the same way and are decoded into JSON values
/// before they leave this module.
#[derive(Clone)]
pub struct AccessApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl AccessApiClient {
    pub fn new(url: &str) -> IndexerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(AccessApiClient {
            http,
            base_url: url.trim().trim_end_matches('/').to_string(),
        })
    }

    /// Maps an error response onto the retry taxonomy. The status code is
    /// folded into the message so substring classification keeps working the
    /// same way for HTTP and for server-reported errors.
    async fn into_chain_error(response: reqwest::Response) -> IndexerError {
        let status = response.status();
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.message)
            .unwrap_or_else(|_| status.to_string());
        let kind = match status.as_u16() {
            429 | 503 => "ResourceExhausted",
            408 | 504 => "DeadlineExceeded",
            400 => "InvalidArgument",
            404 => "NotFound",
            _ => "Upstream",
        };
        IndexerError::Chain(format!("{}: {}", kind, message))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: String) -> IndexerResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Self::into_chain_error(response).await);
        }
        Ok(response.json().await?)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct BlockEnvelope {
    header: BlockHeaderBody,
}

#[derive(Deserialize)]
struct BlockHeaderBody {
    id: String,
    height: String,
}

#[derive(Deserialize)]
struct EventBlock {
    events: Option<Vec<EventBody>>,
}

#[derive(Deserialize)]
struct EventBody {
    #[serde(rename = "type")]
    event_type: String,
    transaction_id: String,
    payload: String,
}

#[derive(Deserialize)]
struct AccountBody {
    address: String,
    keys: Option<Vec<AccountKeyBody>>,
}

#[derive(Deserialize)]
struct AccountKeyBody {
    index: String,
    public_key: String,
    signing_algorithm: String,
    hashing_algorithm: String,
    weight: String,
    revoked: bool,
}

fn parse_u64(field: &str, raw: &str) -> IndexerResult<u64> {
    raw.parse()
        .map_err(|_| IndexerError::Chain(format!("malformed {}: {}", field, raw)))
}

fn parse_i64(field: &str, raw: &str) -> IndexerResult<i64> {
    raw.parse()
        .map_err(|_| IndexerError::Chain(format!("malformed {}: {}", field, raw)))
}

fn decode_payload(payload: &str) -> IndexerResult<serde_json::Value> {
    let raw = BASE64
        .decode(payload)
        .map_err(|e| IndexerError::Chain(format!("malformed event payload: {}", e)))?;
    serde_json::from_slice(&raw)
        .map_err(|e| IndexerError::Chain(format!("malformed event payload: {}", e)))
}

fn account_from_body(body: AccountBody) -> IndexerResult<ChainAccount> {
    let address = Address::parse(&body.address)
        .ok_or_else(|| IndexerError::Chain(format!("malformed address: {}", body.address)))?;
    let mut keys = Vec::new();
    for key in body.keys.unwrap_or_default() {
        keys.push(ChainAccountKey {
            index: parse_i64("key index", &key.index)?,
            public_key: key.public_key,
            sig_algo: key.signing_algorithm,
            hash_algo: key.hashing_algorithm,
            weight: parse_i64("key weight", &key.weight)?,
            revoked: key.revoked,
        });
    }
    Ok(ChainAccount { address, keys })
}

#[async_trait]
impl ChainClient for AccessApiClient {
    async fn get_latest_block_header(&self) -> IndexerResult<BlockHeader> {
        let blocks: Vec<BlockEnvelope> = self.get_json("/v1/blocks?height=sealed".to_string()).await?;
        let block = blocks
            .into_iter()
            .next()
            .ok_or_else(|| IndexerError::Chain("no sealed block returned".to_string()))?;
        Ok(BlockHeader {
            height: parse_u64("block height", &block.header.height)?,
            id: block.header.id,
        })
    }

    async fn get_events_for_height_range(
        &self,
        event_type: &str,
        start_height: u64,
        end_height: u64,
    ) -> IndexerResult<Vec<ChainEvent>> {
        let blocks: Vec<EventBlock> = self
            .get_json(format!(
                "/v1/events?type={}&start_height={}&end_height={}",
                event_type, start_height, end_height
            ))
            .await?;
        let mut events = Vec::new();
        for block in blocks {
            for event in block.events.unwrap_or_default() {
                events.push(ChainEvent {
                    event_type: event.event_type,
                    transaction_id: event.transaction_id,
                    payload: decode_payload(&event.payload)?,
                });
            }
        }
        Ok(events)
    }

    async fn get_account(&self, address: Address) -> IndexerResult<ChainAccount> {
        let body: AccountBody = self
            .get_json(format!("/v1/accounts/{}?expand=keys", address.hex()))
            .await?;
        account_from_body(body)
    }

    async fn execute_script_at_latest_block(
        &self,
        script: &str,
        arguments: Vec<serde_json::Value>,
    ) -> IndexerResult<serde_json::Value> {
        let encoded_args: Vec<String> = arguments
            .iter()
            .map(|arg| BASE64.encode(arg.to_string()))
            .collect();
        let body = serde_json::json!({
            "script": BASE64.encode(script),
            "arguments": encoded_args,
        });
        let url = format!("{}/v1/scripts?block_height=sealed", self.base_url);
        debug!("POST {}", url);
        let response = self.http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Self::into_chain_error(response).await);
        }
        // The script result is a base64 JSON string.
        let encoded: String = response.json().await?;
        decode_payload(&encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_payload_round_trip() {
        let value = json!({ "type": "Event", "value": { "id": "flow.AccountKeyAdded" } });
        let encoded = BASE64.encode(value.to_string());
        assert_eq!(decode_payload(&encoded).unwrap(), value);
        assert!(decode_payload("not base64!").is_err());
    }

    #[test]
    fn test_account_from_body() {
        let body: AccountBody = serde_json::from_value(json!({
            "address": "e544175ee0461c4b",
            "keys": [{
                "index": "0",
                "public_key": "ab".repeat(64),
                "signing_algorithm": "ECDSA_P256",
                "hashing_algorithm": "SHA3_256",
                "weight": "1000",
                "revoked": false,
            }]
        }))
        .unwrap();
        let account = account_from_body(body).unwrap();
        assert_eq!(account.address.canonical(), "0xe544175ee0461c4b");
        assert_eq!(account.keys.len(), 1);
        assert_eq!(account.keys[0].weight, 1000);
        assert_eq!(account.keys[0].sig_algo, "ECDSA_P256");
    }

    #[test]
    fn test_account_with_no_keys() {
        let body: AccountBody =
            serde_json::from_value(json!({ "address": "0xe544175ee0461c4b" })).unwrap();
        let account = account_from_body(body).unwrap();
        assert!(account.keys.is_empty());
    }

    #[test]
    fn test_malformed_numbers_are_chain_errors() {
        assert!(parse_u64("height", "12x").is_err());
        assert!(parse_i64("weight", "").is_err());
        assert_eq!(parse_u64("height", "186356930").unwrap(), 186_356_930);
    }
}
