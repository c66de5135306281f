//! Reliable in-band fallback transport.
//!
//! Tunnels the content's byte-stream through the signaling channel as
//! ordered `data` transport-info chunks. Slow, but it works wherever
//! signaling works, so it is registered at the lowest rank and only wins
//! after every socket path has been blacklisted.
//!
//! Reliability and ordering ride on the channel's own guarantees: each
//! chunk is a request acknowledged by the peer, carrying a sequence number
//! the receiver verifies.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config;
use crate::error::EngineError;
use crate::signaling::message::{ActionResponse, TransportElement, TransportInfoElement};
use crate::transport::candidate::CandidateSet;
use crate::transport::{Direction, NegotiationCtx, Transport, TransportKind, TransportManager};

struct IbbState {
    block_size: usize,
    started: bool,
    /// Expected sequence number of the next incoming chunk.
    next_rx_seq: u64,
    /// Receiver half of the inbound queue, taken by `establish`.
    rx_queue: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// One live in-band stream for one content.
pub struct InBandTransport {
    stream_id: String,
    state: Mutex<IbbState>,
    /// Inbound chunks land here as soon as they are acknowledged, even if
    /// the local side has not started the pumps yet.
    rx_tx: mpsc::UnboundedSender<Vec<u8>>,
    abandon_tx: watch::Sender<bool>,
}

impl InBandTransport {
    fn new(stream_id: String, block_size: usize) -> Self {
        let (rx_tx, rx_queue) = mpsc::unbounded_channel();
        let (abandon_tx, _) = watch::channel(false);
        Self {
            stream_id,
            state: Mutex::new(IbbState {
                block_size,
                started: false,
                next_rx_seq: 0,
                rx_queue: Some(rx_queue),
            }),
            rx_tx,
            abandon_tx,
        }
    }

    /// Verifies the sequence number and queues the chunk for the inbound
    /// pump.
    fn accept_chunk(&self, seq: u64, payload: &[u8]) -> ActionResponse {
        {
            let mut state = self.state.lock();
            if seq != state.next_rx_seq {
                warn!(
                    stream_id = %self.stream_id,
                    expected = state.next_rx_seq,
                    got = seq,
                    "out-of-sequence data chunk"
                );
                return ActionResponse::MalformedRequest;
            }
            state.next_rx_seq += 1;
        }
        // A dropped receiver means the transport was abandoned; the chunk
        // is acknowledged and discarded.
        let _ = self.rx_tx.send(payload.to_vec());
        ActionResponse::Ack
    }
}

#[async_trait]
impl Transport for InBandTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::in_band()
    }

    fn element(&self) -> TransportElement {
        TransportElement {
            kind: TransportKind::in_band(),
            stream_id: self.stream_id.clone(),
            candidates: CandidateSet::new(),
            info: None,
            block_size: Some(self.state.lock().block_size),
        }
    }

    fn merge_peer_offer(&self, element: &TransportElement) {
        if let Some(peer_block) = element.block_size {
            let mut state = self.state.lock();
            // Both sides converge on the smaller block size.
            state.block_size = state.block_size.min(peer_block);
        }
    }

    async fn establish(&self, _direction: Direction, ctx: NegotiationCtx) {
        let (block_size, mut rx_queue) = {
            let mut state = self.state.lock();
            if state.started {
                return;
            }
            state.started = true;
            match state.rx_queue.take() {
                Some(queue) => (state.block_size, queue),
                None => return,
            }
        };

        let (engine_side, app_side) = tokio::io::duplex(config::INBAND_PIPE_CAPACITY);
        let (mut read_half, mut write_half) = tokio::io::split(engine_side);

        // Inbound pump: acknowledged chunks, already in order, into the pipe.
        let mut rx_abandon = self.abandon_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = rx_abandon.changed() => break,
                    chunk = rx_queue.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        // Outbound pump: pipe bytes out as sequenced, acknowledged chunks.
        let mut tx_abandon = self.abandon_tx.subscribe();
        let stream_id = self.stream_id.clone();
        let tx_ctx = ctx.clone();
        tokio::spawn(async move {
            let mut seq: u64 = 0;
            let mut buf = vec![0u8; block_size];
            loop {
                let n = tokio::select! {
                    _ = tx_abandon.changed() => break,
                    read = read_half.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    },
                };
                let info = TransportInfoElement::Data {
                    seq,
                    payload: buf[..n].to_vec(),
                };
                match tx_ctx.send_info_request(info).await {
                    Ok(ActionResponse::Ack) => seq += 1,
                    Ok(response) => {
                        warn!(%stream_id, ?response, "peer refused data chunk");
                        break;
                    }
                    Err(error) => {
                        warn!(%stream_id, %error, "data chunk delivery failed");
                        break;
                    }
                }
            }
        });

        ctx.content.on_transport_ready(ctx.clone(), Box::new(app_side)).await;
    }

    fn handle_info(&self, info: &TransportInfoElement, _ctx: &NegotiationCtx) -> ActionResponse {
        match info {
            TransportInfoElement::Data { seq, payload } => self.accept_chunk(*seq, payload),
            _ => {
                debug!(stream_id = %self.stream_id, "candidate notification on in-band transport");
                ActionResponse::MalformedRequest
            }
        }
    }

    fn abandon(&self) {
        let _ = self.abandon_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// In-Band Transport Manager
// ---------------------------------------------------------------------------

/// Mints [`InBandTransport`] negotiators.
pub struct InBandTransportManager {
    block_size: usize,
}

impl InBandTransportManager {
    /// Creates a manager offering `block_size` byte chunks.
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }
}

impl Default for InBandTransportManager {
    fn default() -> Self {
        Self::new(config::INBAND_BLOCK_SIZE)
    }
}

#[async_trait]
impl TransportManager for InBandTransportManager {
    fn kind(&self) -> TransportKind {
        TransportKind::in_band()
    }

    fn rank(&self) -> u32 {
        config::INBAND_TRANSPORT_RANK
    }

    async fn create_for_initiator(&self) -> Result<Arc<dyn Transport>, EngineError> {
        let stream_id = Uuid::new_v4().to_string();
        Ok(Arc::new(InBandTransport::new(stream_id, self.block_size)))
    }

    async fn create_for_responder(
        &self,
        offer: &TransportElement,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        let transport = InBandTransport::new(offer.stream_id.clone(), self.block_size);
        transport.merge_peer_offer(offer);
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_converges_on_the_smaller_offer() {
        let transport = InBandTransport::new("s-1".to_string(), 4096);
        let offer = TransportElement {
            kind: TransportKind::in_band(),
            stream_id: "s-1".to_string(),
            candidates: CandidateSet::new(),
            info: None,
            block_size: Some(1024),
        };
        transport.merge_peer_offer(&offer);
        assert_eq!(transport.state.lock().block_size, 1024);

        // A larger peer offer never grows the local size.
        let bigger = TransportElement {
            block_size: Some(65536),
            ..offer
        };
        transport.merge_peer_offer(&bigger);
        assert_eq!(transport.state.lock().block_size, 1024);
    }

    #[test]
    fn chunks_must_arrive_in_sequence() {
        let transport = InBandTransport::new("s-1".to_string(), 4096);
        assert_eq!(transport.accept_chunk(1, &[1]), ActionResponse::MalformedRequest);
        assert_eq!(transport.accept_chunk(0, &[1]), ActionResponse::Ack);
        assert_eq!(transport.accept_chunk(0, &[2]), ActionResponse::MalformedRequest);
        assert_eq!(transport.accept_chunk(1, &[2]), ActionResponse::Ack);
    }

    #[tokio::test]
    async fn acknowledged_chunks_queue_before_establishment() {
        let transport = InBandTransport::new("s-1".to_string(), 4096);
        // Chunks arriving before the pumps start are queued, not dropped.
        assert_eq!(transport.accept_chunk(0, &[0xAA]), ActionResponse::Ack);
        assert_eq!(transport.accept_chunk(1, &[0xBB]), ActionResponse::Ack);

        let mut queue = transport.state.lock().rx_queue.take().expect("queue");
        assert_eq!(queue.recv().await, Some(vec![0xAA]));
        assert_eq!(queue.recv().await, Some(vec![0xBB]));
    }
}
