//! `token` handler — balances, supplies and transfers of a standard token
//! contract.
//!
//! | table | key | from |
//! |---|---|---|
//! | `token_stats` | symbol | `stat` deltas (priority 10) |
//! | `token_balances` | `owner/symbol` | `accounts` deltas (priority 10) |
//! | `token_transfers` | global sequence | `transfer` actions (priority 20) |
//!
//! Transfers are annotated from the handler's [`TokenCache`], so the stat
//! processor must run first when both land in one block.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use chainreader_core::error::IndexerError;
use chainreader_core::handler::{ContractHandler, TableSnapshot};
use chainreader_core::processor::{DataProcessor, Processor, Registration};
use chainreader_core::store::StoreTx;
use chainreader_core::types::{BlockHeader, Record, TableDelta};
use chainreader_core::writer::{row_key, BlockWriter};

use crate::asset::Asset;

const HANDLER: &str = "token";

/// Current schema version. v1 stored balances as `{"balance": "<asset>"}`.
pub const VERSION: u32 = 2;

pub const STATS: &str = "token_stats";
pub const BALANCES: &str = "token_balances";
pub const TRANSFERS: &str = "token_transfers";

const STAT_PRIORITY: i32 = 10;
const BALANCE_PRIORITY: i32 = 10;
const TRANSFER_PRIORITY: i32 = 20;

/// ABI of the standard token contract (the parts this handler reads).
pub const TOKEN_ABI: &str = r#"{
    "structs": [
        {"name": "account", "base": "", "fields": [{"name": "balance", "type": "asset"}]},
        {"name": "currency_stats", "base": "", "fields": [
            {"name": "supply", "type": "asset"},
            {"name": "max_supply", "type": "asset"},
            {"name": "issuer", "type": "name"}
        ]},
        {"name": "transfer", "base": "", "fields": [
            {"name": "from", "type": "name"},
            {"name": "to", "type": "name"},
            {"name": "quantity", "type": "asset"},
            {"name": "memo", "type": "string"}
        ]},
        {"name": "create", "base": "", "fields": [
            {"name": "issuer", "type": "name"},
            {"name": "maximum_supply", "type": "asset"}
        ]},
        {"name": "issue", "base": "", "fields": [
            {"name": "to", "type": "name"},
            {"name": "quantity", "type": "asset"},
            {"name": "memo", "type": "string"}
        ]},
        {"name": "retire", "base": "", "fields": [
            {"name": "quantity", "type": "asset"},
            {"name": "memo", "type": "string"}
        ]},
        {"name": "open", "base": "", "fields": [
            {"name": "owner", "type": "name"},
            {"name": "symbol", "type": "symbol"},
            {"name": "ram_payer", "type": "name"}
        ]},
        {"name": "close", "base": "", "fields": [
            {"name": "owner", "type": "name"},
            {"name": "symbol", "type": "symbol"}
        ]}
    ],
    "actions": [
        {"name": "create", "type": "create"},
        {"name": "issue", "type": "issue"},
        {"name": "retire", "type": "retire"},
        {"name": "transfer", "type": "transfer"},
        {"name": "open", "type": "open"},
        {"name": "close", "type": "close"}
    ],
    "tables": [
        {"name": "accounts", "type": "account"},
        {"name": "stat", "type": "currency_stats"}
    ]
}"#;

fn bad_row(reason: impl ToString) -> IndexerError {
    IndexerError::handler(HANDLER, reason)
}

fn asset_field(value: &Value, field: &str) -> Result<Asset, IndexerError> {
    value[field]
        .as_str()
        .ok_or_else(|| bad_row(format!("missing asset field '{field}'")))?
        .parse()
        .map_err(bad_row)
}

fn str_field<'a>(value: &'a Value, field: &str) -> Result<&'a str, IndexerError> {
    value[field]
        .as_str()
        .ok_or_else(|| bad_row(format!("missing field '{field}'")))
}

// ─── Cache ───────────────────────────────────────────────────────────────────

/// Supply configuration of one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStat {
    pub symbol: String,
    pub precision: u8,
    pub supply: i64,
    pub max_supply: i64,
    pub issuer: String,
}

impl TokenStat {
    fn from_row(value: &Value) -> Result<Self, IndexerError> {
        let supply = asset_field(value, "supply")?;
        let max_supply = asset_field(value, "max_supply")?;
        if supply.symbol != max_supply.symbol || supply.precision != max_supply.precision {
            return Err(IndexerError::invariant(
                HANDLER,
                format!("supply {supply} and max supply {max_supply} disagree"),
            ));
        }
        Ok(Self {
            symbol: supply.symbol,
            precision: supply.precision,
            supply: supply.amount,
            max_supply: max_supply.amount,
            issuer: str_field(value, "issuer")?.to_string(),
        })
    }
}

/// Token configs by symbol. Owned by one [`TokenHandler`]; only its stat
/// processor writes to it during a block.
#[derive(Clone, Default)]
pub struct TokenCache {
    stats: Arc<RwLock<HashMap<String, TokenStat>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, symbol: &str) -> Option<TokenStat> {
        self.stats.read().await.get(symbol).cloned()
    }

    pub async fn len(&self) -> usize {
        self.stats.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.stats.read().await.is_empty()
    }

    async fn insert(&self, stat: TokenStat) {
        self.stats.write().await.insert(stat.symbol.clone(), stat);
    }

    async fn remove(&self, symbol: &str) {
        self.stats.write().await.remove(symbol);
    }

    async fn clear(&self) {
        self.stats.write().await.clear();
    }

    /// Replace the contents with the committed `token_stats` rows.
    async fn reload(&self, conn: &mut dyn StoreTx) -> Result<usize, IndexerError> {
        let mut stats = HashMap::new();
        for (_, value) in conn.scan(STATS).await? {
            let stat: TokenStat = serde_json::from_value(value).map_err(bad_row)?;
            stats.insert(stat.symbol.clone(), stat);
        }
        let count = stats.len();
        *self.stats.write().await = stats;
        Ok(count)
    }
}

// ─── Row application (shared by processors and backfill) ─────────────────────

async fn apply_stat(writer: &mut BlockWriter<'_>, cache: &TokenCache, delta: &TableDelta) -> Result<(), IndexerError> {
    if !delta.present {
        writer.delete(STATS, &delta.scope).await?;
        cache.remove(&delta.scope).await;
        return Ok(());
    }
    let stat = TokenStat::from_row(&delta.value)?;
    let row = serde_json::to_value(&stat).map_err(bad_row)?;
    writer.upsert(STATS, &stat.symbol, row).await?;
    cache.insert(stat).await;
    Ok(())
}

async fn apply_balance(writer: &mut BlockWriter<'_>, delta: &TableDelta) -> Result<(), IndexerError> {
    let key = row_key(&delta.scope, &delta.primary_key);
    if !delta.present {
        writer.delete(BALANCES, &key).await?;
        return Ok(());
    }
    let balance = asset_field(&delta.value, "balance")?;
    writer.upsert(BALANCES, &key, balance_row(&delta.scope, &balance)).await
}

fn balance_row(owner: &str, balance: &Asset) -> Value {
    json!({
        "owner": owner,
        "symbol": balance.symbol,
        "precision": balance.precision,
        "amount": balance.amount,
    })
}

// ─── Processors ──────────────────────────────────────────────────────────────

struct StatProcessor {
    cache: TokenCache,
    start_block: u64,
}

#[async_trait]
impl Processor for StatProcessor {
    async fn process(&self, writer: &mut BlockWriter<'_>, block: &BlockHeader, record: &Record) -> Result<(), IndexerError> {
        match record.as_delta() {
            Some(delta) if block.number >= self.start_block => apply_stat(writer, &self.cache, delta).await,
            _ => Ok(()),
        }
    }
}

struct BalanceProcessor {
    start_block: u64,
}

#[async_trait]
impl Processor for BalanceProcessor {
    async fn process(&self, writer: &mut BlockWriter<'_>, block: &BlockHeader, record: &Record) -> Result<(), IndexerError> {
        match record.as_delta() {
            Some(delta) if block.number >= self.start_block => apply_balance(writer, delta).await,
            _ => Ok(()),
        }
    }
}

struct TransferProcessor {
    cache: TokenCache,
    start_block: u64,
}

#[async_trait]
impl Processor for TransferProcessor {
    async fn process(&self, writer: &mut BlockWriter<'_>, block: &BlockHeader, record: &Record) -> Result<(), IndexerError> {
        let Some(action) = record.as_action() else {
            return Ok(());
        };
        if block.number < self.start_block {
            return Ok(());
        }
        let quantity = asset_field(&action.data, "quantity")?;
        let issuer = match self.cache.get(&quantity.symbol).await {
            Some(stat) if stat.precision != quantity.precision => {
                return Err(IndexerError::invariant(
                    HANDLER,
                    format!(
                        "transfer of {quantity} at block {} does not match {} precision {}",
                        block.number, stat.symbol, stat.precision
                    ),
                ));
            }
            Some(stat) => Value::String(stat.issuer),
            None => Value::Null,
        };
        let row = json!({
            "block": block.number,
            "tx_id": action.tx_id,
            "from": str_field(&action.data, "from")?,
            "to": str_field(&action.data, "to")?,
            "symbol": quantity.symbol,
            "precision": quantity.precision,
            "amount": quantity.amount,
            "memo": action.data["memo"].as_str().unwrap_or_default(),
            "issuer": issuer,
        });
        writer
            .upsert(TRANSFERS, &format!("{:020}", action.global_sequence), row)
            .await
    }
}

// ─── Handler ─────────────────────────────────────────────────────────────────

/// Indexes one token contract.
pub struct TokenHandler {
    contract: String,
    start_block: u64,
    cache: TokenCache,
}

impl TokenHandler {
    /// Handler for `contract`, writing token configs into `cache`.
    pub fn new(contract: impl Into<String>, cache: TokenCache) -> Self {
        Self {
            contract: contract.into(),
            start_block: 0,
            cache,
        }
    }

    /// Ignore records of blocks before `block`.
    pub fn start_block(mut self, block: u64) -> Self {
        self.start_block = block;
        self
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }
}

#[async_trait]
impl ContractHandler for TokenHandler {
    fn name(&self) -> &str {
        HANDLER
    }

    fn version(&self) -> u32 {
        VERSION
    }

    async fn setup(&self, conn: &mut dyn StoreTx) -> Result<bool, IndexerError> {
        for table in [STATS, BALANCES, TRANSFERS] {
            conn.create_table(table).await?;
        }
        let created = conn.schema_version(HANDLER).await?.is_none();
        let cached = self.cache.reload(conn).await?;
        debug!(contract = %self.contract, created, cached, "token tables ready");
        Ok(created)
    }

    async fn upgrade(&self, conn: &mut dyn StoreTx, from_version: u32) -> Result<(), IndexerError> {
        if from_version < 2 {
            let mut migrated = 0;
            for (key, value) in conn.scan(BALANCES).await? {
                let Some(text) = value.get("balance").and_then(Value::as_str) else {
                    continue;
                };
                let balance: Asset = text.parse().map_err(bad_row)?;
                let owner = key.split_once('/').map_or(key.as_str(), |(owner, _)| owner);
                conn.put(BALANCES, &key, &balance_row(owner, &balance)).await?;
                migrated += 1;
            }
            info!(contract = %self.contract, migrated, "token balances migrated to v2");
        }
        Ok(())
    }

    async fn init(&self, writer: &mut BlockWriter<'_>, snapshot: &dyn TableSnapshot) -> Result<(), IndexerError> {
        for delta in snapshot.table_rows(&self.contract, "stat").await? {
            apply_stat(writer, &self.cache, &delta).await?;
        }
        for delta in snapshot.table_rows(&self.contract, "accounts").await? {
            apply_balance(writer, &delta).await?;
        }
        Ok(())
    }

    fn register(&self, processor: &mut DataProcessor) -> Vec<Registration> {
        let start_block = self.start_block;
        vec![
            processor.on_table(
                HANDLER,
                &self.contract,
                "stat",
                STAT_PRIORITY,
                Arc::new(StatProcessor {
                    cache: self.cache.clone(),
                    start_block,
                }),
            ),
            processor.on_table(
                HANDLER,
                &self.contract,
                "accounts",
                BALANCE_PRIORITY,
                Arc::new(BalanceProcessor { start_block }),
            ),
            processor.on_action(
                HANDLER,
                &self.contract,
                "transfer",
                TRANSFER_PRIORITY,
                Arc::new(TransferProcessor {
                    cache: self.cache.clone(),
                    start_block,
                }),
            ),
        ]
    }

    async fn delete_db(&self, conn: &mut dyn StoreTx) -> Result<(), IndexerError> {
        for table in [STATS, BALANCES, TRANSFERS] {
            let removed = conn.clear_table(table).await?;
            debug!(table, removed, "token table cleared");
        }
        self.cache.clear().await;
        Ok(())
    }

    async fn on_rollback(&self, conn: &mut dyn StoreTx) -> Result<(), IndexerError> {
        let cached = self.cache.reload(conn).await?;
        debug!(contract = %self.contract, cached, "token cache reloaded after rollback");
        Ok(())
    }
}
