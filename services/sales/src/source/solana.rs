use super::token_metadata::{decode_metadata, metadata_address};
use super::{
    ActivitySource, Cursor, MetadataLookup, PageRequest, RawActivity, SourceError, TradeDetail,
};
use crate::record::{NftInfo, SaleRecord};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Upper bound for `getSignaturesForAddress`
pub const MAX_SIGNATURE_PAGE: u32 = 1000;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub block_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub meta: Option<TransactionMeta>,
    pub transaction: TransactionBody,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    #[serde(default)]
    pub err: Option<Value>,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    #[serde(default)]
    pub post_token_balances: Vec<TokenBalance>,
    #[serde(default)]
    pub loaded_addresses: Option<LoadedAddresses>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenBalance {
    pub mint: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoadedAddresses {
    #[serde(default)]
    pub writable: Vec<String>,
    #[serde(default)]
    pub readonly: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionBody {
    pub message: TransactionMessage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMessage {
    pub account_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AccountInfoResult {
    value: Option<AccountInfo>,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    /// `[payload, encoding]`
    data: (String, String),
}

fn unix_time(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// JSON-RPC client for a Solana node
pub struct SolanaRpcClient {
    http: reqwest::Client,
    url: String,
    commitment: String,
    next_id: AtomicU64,
}

impl SolanaRpcClient {
    pub fn new(url: &str, commitment: &str, timeout: Duration) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, url, commitment))
    }

    pub fn with_client(http: reqwest::Client, url: &str, commitment: &str) -> Self {
        Self {
            http,
            url: url.to_string(),
            commitment: commitment.to_string(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Call `method`; `Ok(None)` when the node returns a null result.
    async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, SourceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .http
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::RateLimited(format!("rpc {method}")));
        }

        let body: RpcResponse<T> = response.error_for_status()?.json().await?;
        if let Some(error) = body.error {
            return Err(SourceError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(body.result)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, SourceError> {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| SourceError::Malformed(format!("{method} returned no result")))
    }

    /// Signatures involving `address`, newest first.
    #[instrument(skip(self, request), fields(limit = request.limit))]
    pub async fn get_signatures_for_address(
        &self,
        address: &str,
        request: &PageRequest,
    ) -> Result<Vec<SignatureInfo>, SourceError> {
        let mut options = json!({
            "limit": request.limit.clamp(1, MAX_SIGNATURE_PAGE),
            "commitment": self.commitment,
        });
        if let Some(Cursor::Signature(before)) = &request.before {
            options["before"] = json!(before);
        }
        if let Some(Cursor::Signature(until)) = &request.until {
            options["until"] = json!(until);
        }

        self.call("getSignaturesForAddress", json!([address, options]))
            .await
    }

    pub async fn get_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<TransactionResponse>, SourceError> {
        self.call_optional(
            "getTransaction",
            json!([signature, {
                "encoding": "json",
                "commitment": self.commitment,
                "maxSupportedTransactionVersion": 0,
            }]),
        )
        .await
    }

    /// Raw account data, or `None` if the account does not exist.
    pub async fn get_account_data(&self, address: &str) -> Result<Option<Vec<u8>>, SourceError> {
        let result: AccountInfoResult = self
            .call(
                "getAccountInfo",
                json!([address, {"encoding": "base64", "commitment": self.commitment}]),
            )
            .await?;

        result
            .value
            .map(|account| {
                STANDARD
                    .decode(account.data.0)
                    .map_err(|e| SourceError::Malformed(format!("account {address} data: {e}")))
            })
            .transpose()
    }
}

#[async_trait]
impl MetadataLookup for SolanaRpcClient {
    async fn nft_metadata(&self, mint: &str) -> Result<NftInfo, SourceError> {
        let address = metadata_address(mint)?;
        let data = self
            .get_account_data(&address)
            .await?
            .ok_or_else(|| SourceError::Malformed(format!("no metadata account for mint {mint}")))?;
        decode_metadata(&data)
    }
}

/// Turn a confirmed transaction into trade detail.
///
/// Returns `None` for failed transactions and ones that moved no token.
pub fn trade_detail(transaction: TransactionResponse) -> Option<TradeDetail> {
    let meta = transaction.meta?;
    if meta.err.is_some() {
        return None;
    }

    let mint = meta.post_token_balances.first()?.mint.clone();
    let price = match (meta.pre_balances.first(), meta.post_balances.first()) {
        (Some(pre), Some(post)) => pre.abs_diff(*post),
        _ => return None,
    };

    let mut account_keys = transaction.transaction.message.account_keys;
    if let Some(loaded) = meta.loaded_addresses {
        account_keys.extend(loaded.writable);
        account_keys.extend(loaded.readonly);
    }

    Some(TradeDetail {
        mint,
        price,
        marketplace: None,
        account_keys,
        pre_balances: meta.pre_balances,
        post_balances: meta.post_balances,
        buyer: None,
        seller: None,
        time: transaction.block_time.and_then(unix_time),
    })
}

/// Chain-derived activity: every signature touching the collection's
/// royalty address.
pub struct SolanaSource {
    rpc: Arc<SolanaRpcClient>,
    address: String,
    page_limit: u32,
}

impl SolanaSource {
    pub fn new(rpc: Arc<SolanaRpcClient>, address: &str, page_limit: u32) -> Self {
        Self {
            rpc,
            address: address.to_string(),
            page_limit,
        }
    }
}

#[async_trait]
impl ActivitySource for SolanaSource {
    fn name(&self) -> &'static str {
        "solana"
    }

    fn page_limit(&self) -> u32 {
        self.page_limit
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawActivity>, SourceError> {
        let signatures = self
            .rpc
            .get_signatures_for_address(&self.address, request)
            .await?;

        debug!(count = signatures.len(), "Fetched signature page");

        Ok(signatures
            .into_iter()
            .map(|info| RawActivity {
                cursor: Cursor::Signature(info.signature.clone()),
                event_time: info.block_time.and_then(unix_time),
                failed: info.err.is_some(),
                detail: None,
                id: info.signature,
            })
            .collect())
    }

    async fn load_detail(&self, activity: &RawActivity) -> Result<Option<TradeDetail>, SourceError> {
        if activity.failed {
            return Ok(None);
        }
        Ok(self
            .rpc
            .get_transaction(&activity.id)
            .await?
            .and_then(trade_detail))
    }

    fn cursor_for(&self, record: &SaleRecord) -> Option<Cursor> {
        Some(Cursor::Signature(record.id.clone()))
    }
}
