//! Block sources: where raw block envelopes come from.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use chainreader_core::error::IndexerError;
use chainreader_core::types::BlockPosition;

use crate::envelope::{ClientMessage, SourceMessage};

/// Stream of messages from one connection. Ends when the connection does.
pub type SourceStream = BoxStream<'static, Result<SourceMessage, IndexerError>>;

/// Parameters of one `get_blocks` session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub start_block: u64,
    pub end_block: Option<u64>,
    pub max_messages_in_flight: u32,
    /// Blocks the client already holds; the node forks from the first it does not share.
    pub have_positions: Vec<BlockPosition>,
}

/// A node connection factory. Each `open` is one session from `start_block`.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn open(&self, request: &BlockRequest) -> Result<SourceStream, IndexerError>;
}

// ─── WebSocket ───────────────────────────────────────────────────────────────

/// WebSocket block source speaking the JSON envelope framing.
pub struct WsBlockSource {
    url: String,
}

impl WsBlockSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn transport(e: impl ToString) -> IndexerError {
    IndexerError::Transport(e.to_string())
}

#[async_trait]
impl BlockSource for WsBlockSource {
    async fn open(&self, request: &BlockRequest) -> Result<SourceStream, IndexerError> {
        info!(url = %self.url, start = request.start_block, "connecting via WebSocket");
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(transport)?;
        let (mut sink, stream) = ws.split();

        let get_blocks = ClientMessage::GetBlocks {
            start_block: request.start_block,
            end_block: request.end_block,
            max_messages_in_flight: request.max_messages_in_flight,
            have_positions: request.have_positions.clone(),
        };
        let text = serde_json::to_string(&get_blocks).map_err(|e| IndexerError::Other(e.to_string()))?;
        sink.send(Message::Text(text)).await.map_err(transport)?;

        let ack = serde_json::to_string(&ClientMessage::Ack { num_messages: 1 })
            .map_err(|e| IndexerError::Other(e.to_string()))?;

        let messages = stream::unfold((sink, stream, ack), |(mut sink, mut stream, ack)| async move {
            loop {
                let frame = match stream.next().await {
                    None | Some(Ok(Message::Close(_))) => return None,
                    Some(Err(e)) => return Some((Err(transport(e)), (sink, stream, ack))),
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };
                let item = match serde_json::from_str::<SourceMessage>(&frame) {
                    Ok(msg) => match sink.send(Message::Text(ack.clone())).await {
                        Ok(()) => Ok(msg),
                        Err(e) => Err(transport(e)),
                    },
                    Err(e) => Err(IndexerError::Other(format!("malformed frame: {e}"))),
                };
                return Some((item, (sink, stream, ack)));
            }
        });
        Ok(messages.boxed())
    }
}

// ─── Scripted ────────────────────────────────────────────────────────────────

type Session = Vec<Result<SourceMessage, IndexerError>>;

/// A source replaying pre-recorded sessions, one per `open`.
///
/// Used for tests and dry runs. Once the sessions run out, `open` fails with
/// a transport error.
#[derive(Default)]
pub struct ScriptedSource {
    sessions: Mutex<VecDeque<Session>>,
    requests: Mutex<Vec<BlockRequest>>,
    hold_open: bool,
}

impl ScriptedSource {
    pub fn new(sessions: Vec<Session>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            requests: Mutex::new(Vec::new()),
            hold_open: false,
        }
    }

    /// One session delivering `messages`.
    pub fn single(messages: Vec<SourceMessage>) -> Self {
        Self::new(vec![messages.into_iter().map(Ok).collect()])
    }

    /// Keep every session's stream open (pending) after its last message.
    pub fn holding_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<BlockRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BlockSource for ScriptedSource {
    async fn open(&self, request: &BlockRequest) -> Result<SourceStream, IndexerError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let session = self
            .sessions
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .ok_or_else(|| IndexerError::Transport("script exhausted".into()))?;
        debug!(start = request.start_block, messages = session.len(), "scripted session opened");

        let messages = stream::iter(session);
        if self.hold_open {
            Ok(messages.chain(stream::pending()).boxed())
        } else {
            Ok(messages.boxed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_sessions_replay_in_order() {
        let source = ScriptedSource::new(vec![
            vec![Ok(SourceMessage::Fork { block_num: 3 })],
            vec![Err(IndexerError::Transport("reset".into()))],
        ]);
        let req = BlockRequest {
            start_block: 1,
            end_block: None,
            max_messages_in_flight: 5,
            have_positions: vec![],
        };

        let first: Vec<_> = source.open(&req).await.unwrap().collect().await;
        assert!(matches!(first[0], Ok(SourceMessage::Fork { block_num: 3 })));
        let second: Vec<_> = source.open(&req).await.unwrap().collect().await;
        assert!(second[0].as_ref().unwrap_err().is_transient());
        assert!(source.open(&req).await.is_err());
        assert_eq!(source.requests().len(), 3);
    }
}
