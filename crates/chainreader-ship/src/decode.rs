//! Decode queue — turns raw envelopes into [`DecodedBlock`]s.
//!
//! Decoding is CPU-bound, so each block is decoded on the blocking pool.
//! At most `workers` blocks are in flight and results come out in arrival
//! order, so fork markers stay exactly where the stream put them.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use tracing::trace;

use chainreader_core::error::IndexerError;
use chainreader_core::types::{ActionTrace, BlockHeader, DecodedBlock, Record, StreamItem, TableDelta};

use crate::abi::{Abi, CompiledAbi};
use crate::client::BlockReceiver;
use crate::envelope::{RawBlock, SourceMessage};

/// ABIs by contract account.
#[derive(Debug, Clone, Default)]
pub struct AbiRegistry {
    contracts: HashMap<String, CompiledAbi>,
}

impl AbiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, contract: impl Into<String>, abi: &Abi) {
        self.contracts.insert(contract.into(), abi.compile());
    }

    pub fn get(&self, contract: &str) -> Option<&CompiledAbi> {
        self.contracts.get(contract)
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Decode one block. Records of contracts without an ABI are skipped. For
    /// a contract with an ABI, a table or action the ABI does not list and
    /// malformed data are errors.
    pub fn decode_block(&self, raw: RawBlock) -> Result<DecodedBlock, IndexerError> {
        let block = raw.block_num;
        let fail = |reason: String| IndexerError::Decode { block, reason };
        let header = BlockHeader {
            number: raw.block_num,
            irreversible: raw.is_irreversible(),
            id: raw.block_id,
            timestamp: raw.timestamp,
            head: raw.head,
            last_irreversible: raw.last_irreversible,
        };

        let mut records = Vec::with_capacity(raw.deltas.len() + raw.traces.len());
        for delta in raw.deltas {
            let Some(abi) = self.get(&delta.code) else {
                trace!(block, contract = %delta.code, table = %delta.table, "no ABI for delta, skipped");
                continue;
            };
            let unknown_table = || fail(format!("{}::{} is not a table of the contract ABI", delta.code, delta.table));
            if !abi.has_table(&delta.table) {
                return Err(unknown_table());
            }
            let value = if delta.data.is_empty() {
                serde_json::Value::Null
            } else {
                let bytes = hex::decode(&delta.data)
                    .map_err(|e| fail(format!("{}::{} row is not hex: {e}", delta.code, delta.table)))?;
                match abi.decode_table_row(&delta.table, &bytes) {
                    Some(Ok(v)) => v,
                    Some(Err(e)) => return Err(fail(format!("{}::{}: {e}", delta.code, delta.table))),
                    None => return Err(unknown_table()),
                }
            };
            records.push(Record::Delta(TableDelta {
                contract: delta.code,
                table: delta.table,
                scope: delta.scope,
                primary_key: delta.primary_key,
                present: delta.present,
                value,
            }));
        }

        let mut traces = raw.traces;
        traces.sort_by_key(|t| t.global_sequence);
        for trace in traces {
            let Some(abi) = self.get(&trace.account) else {
                trace!(block, contract = %trace.account, action = %trace.name, "no ABI for action, skipped");
                continue;
            };
            let bytes = hex::decode(&trace.data)
                .map_err(|e| fail(format!("{}::{} payload is not hex: {e}", trace.account, trace.name)))?;
            let data = match abi.decode_action(&trace.name, &bytes) {
                Some(Ok(v)) => v,
                Some(Err(e)) => return Err(fail(format!("{}::{}: {e}", trace.account, trace.name))),
                None => {
                    return Err(fail(format!(
                        "{}::{} is not an action of the contract ABI",
                        trace.account, trace.name
                    )))
                }
            };
            records.push(Record::Action(ActionTrace {
                global_sequence: trace.global_sequence,
                contract: trace.account,
                action: trace.name,
                data,
                tx_id: trace.tx_id,
                authorization: trace.authorization,
            }));
        }

        Ok(DecodedBlock { header, records })
    }
}

/// Order-preserving decode stage with bounded parallelism.
pub struct DecodeQueue {
    abis: Arc<AbiRegistry>,
    workers: usize,
}

impl DecodeQueue {
    pub fn new(abis: Arc<AbiRegistry>, workers: usize) -> Self {
        Self {
            abis,
            workers: workers.max(1),
        }
    }

    /// Decode everything `rx` yields, in order.
    pub fn run(self, rx: BlockReceiver) -> impl Stream<Item = Result<StreamItem, IndexerError>> + Send + 'static {
        let abis = self.abis;
        let incoming = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) });
        incoming
            .map(move |message| {
                let abis = Arc::clone(&abis);
                async move {
                    match message? {
                        SourceMessage::Fork { block_num } => Ok(StreamItem::Fork(block_num)),
                        SourceMessage::Block(raw) => {
                            let block = raw.block_num;
                            tokio::task::spawn_blocking(move || abis.decode_block(raw))
                                .await
                                .map_err(|e| IndexerError::Decode {
                                    block,
                                    reason: format!("decode task failed: {e}"),
                                })?
                                .map(StreamItem::Block)
                        }
                    }
                }
            })
            .buffered(self.workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{RawDelta, RawTrace};
    use serde_json::json;
    use tokio::sync::mpsc;

    const ABI: &str = r#"{
        "structs": [
            {"name": "row", "fields": [{"name": "id", "type": "uint64"}, {"name": "value", "type": "uint64"}]}
        ],
        "actions": [{"name": "set", "type": "row"}],
        "tables": [{"name": "rows", "type": "row"}]
    }"#;

    fn registry() -> AbiRegistry {
        let mut abis = AbiRegistry::new();
        abis.insert("kv", &Abi::from_json(ABI).unwrap());
        abis
    }

    fn row_hex(id: u64, value: u64) -> String {
        let mut bytes = id.to_le_bytes().to_vec();
        bytes.extend_from_slice(&value.to_le_bytes());
        hex::encode(bytes)
    }

    fn raw_block(number: u64) -> RawBlock {
        RawBlock {
            block_num: number,
            block_id: format!("{number:08x}"),
            prev_id: String::new(),
            timestamp: 0,
            head: number + 5,
            last_irreversible: 10,
            deltas: vec![
                RawDelta {
                    code: "kv".into(),
                    table: "rows".into(),
                    scope: "kv".into(),
                    primary_key: "1".into(),
                    present: true,
                    data: row_hex(1, number),
                },
                RawDelta {
                    code: "other".into(),
                    table: "rows".into(),
                    scope: "x".into(),
                    primary_key: "1".into(),
                    present: true,
                    data: "zz".into(),
                },
            ],
            traces: vec![
                RawTrace {
                    global_sequence: 9,
                    account: "kv".into(),
                    name: "set".into(),
                    data: row_hex(2, 20),
                    tx_id: "t2".into(),
                    authorization: vec![],
                },
                RawTrace {
                    global_sequence: 8,
                    account: "kv".into(),
                    name: "set".into(),
                    data: row_hex(1, 10),
                    tx_id: "t1".into(),
                    authorization: vec!["alice@active".into()],
                },
            ],
        }
    }

    #[test]
    fn decodes_deltas_then_traces_by_sequence() {
        let block = registry().decode_block(raw_block(12)).unwrap();
        assert!(!block.header.irreversible);
        assert_eq!(block.records.len(), 3);

        let delta = block.records[0].as_delta().unwrap();
        assert_eq!(delta.value, json!({"id": 1, "value": 12}));
        let seqs: Vec<u64> = block.records[1..]
            .iter()
            .map(|r| r.as_action().unwrap().global_sequence)
            .collect();
        assert_eq!(seqs, vec![8, 9]);
        assert_eq!(block.records[1].as_action().unwrap().data, json!({"id": 1, "value": 10}));
    }

    #[test]
    fn malformed_known_row_fails_with_block_context() {
        let mut raw = raw_block(3);
        raw.deltas[0].data = "0102".into();
        let err = registry().decode_block(raw).unwrap_err();
        assert!(matches!(err, IndexerError::Decode { block: 3, .. }));
    }

    #[test]
    fn unlisted_table_or_action_of_a_known_contract_is_fatal() {
        let mut raw = raw_block(4);
        raw.deltas[0].table = "ghosts".into();
        let err = registry().decode_block(raw).unwrap_err();
        assert!(matches!(err, IndexerError::Decode { block: 4, ref reason } if reason.contains("kv::ghosts")));

        let mut raw = raw_block(5);
        raw.traces[1].name = "erase".into();
        let err = registry().decode_block(raw).unwrap_err();
        assert!(matches!(err, IndexerError::Decode { block: 5, ref reason } if reason.contains("kv::erase")));
    }

    #[tokio::test]
    async fn queue_preserves_order_around_forks() {
        let (tx, rx) = mpsc::channel(16);
        for n in 1..=4 {
            tx.send(Ok(SourceMessage::Block(raw_block(n)))).await.unwrap();
        }
        tx.send(Ok(SourceMessage::Fork { block_num: 3 })).await.unwrap();
        tx.send(Ok(SourceMessage::Block(raw_block(3)))).await.unwrap();
        drop(tx);

        let items: Vec<_> = DecodeQueue::new(Arc::new(registry()), 3).run(rx).collect().await;
        let order: Vec<String> = items
            .into_iter()
            .map(|item| match item.unwrap() {
                StreamItem::Block(b) => format!("b{}", b.header.number),
                StreamItem::Fork(n) => format!("f{n}"),
            })
            .collect();
        assert_eq!(order, vec!["b1", "b2", "b3", "b4", "f3", "b3"]);
    }
}
