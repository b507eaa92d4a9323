//! Exchange abstraction: a single request/response conversation, identified by an
//! exchange id, layered on top of a secure [Session] and a [transport::Connection].
//!
//! This generalizes two overlapping pieces of the teacher codebase
//! (`retransmit::RetrContext`'s synchronous per-call retransmit loop and
//! `active_connection::ActiveConnection`'s background read task with oneshot-per-exchange
//! routing) into the single collaborator the rest of this crate depends on: something
//! that can open an exchange, send/request/receive on it, and hand back unsolicited
//! messages (subscription reports) that arrive outside of any open exchange.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{MatterError, Result};
use crate::{
    messages::{self, Message, ProtocolMessageHeader},
    session::Session,
    transport,
};

/// Byte transport an [ExchangeProviderImpl] reads/writes, abstracting over the real
/// UDP [transport::Connection] so that `messenger`/`pase`/`case_server`/`interaction`
/// tests can run against an in-memory [LoopbackWire] instead of real sockets.
#[async_trait]
pub trait Wire: Send + Sync {
    async fn send(&self, data: &[u8]) -> anyhow::Result<()>;
    async fn receive(&self, timeout: Duration) -> anyhow::Result<Vec<u8>>;
}

#[async_trait]
impl Wire for transport::Connection {
    async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        transport::Connection::send(self, data).await
    }
    async fn receive(&self, timeout: Duration) -> anyhow::Result<Vec<u8>> {
        transport::Connection::receive(self, timeout).await
    }
}

/// In-memory [Wire] half; paired with another via [loopback_pair] for deterministic
/// tests of the protocol-core modules with no real socket involved.
pub struct LoopbackWire {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl Wire for LoopbackWire {
    async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        self.tx.send(data.to_vec()).await?;
        Ok(())
    }
    async fn receive(&self, timeout: Duration) -> anyhow::Result<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("loopback peer dropped"))
    }
}

/// Build a connected pair of [LoopbackWire]s: data sent on one arrives on the other.
pub fn loopback_pair() -> (LoopbackWire, LoopbackWire) {
    let (a_tx, b_rx) = mpsc::channel(32);
    let (b_tx, a_rx) = mpsc::channel(32);
    (
        LoopbackWire {
            tx: a_tx,
            rx: Mutex::new(a_rx),
        },
        LoopbackWire {
            tx: b_tx,
            rx: Mutex::new(b_rx),
        },
    )
}

const RECEIVE_POLL: Duration = Duration::from_secs(1);
const RETRANSMIT_THRESHOLD: Duration = Duration::from_secs(3);
const MAX_RETRANSMIT_AGE: Duration = Duration::from_secs(10);
const MAX_CACHED_COUNTERS: usize = 32;

/// A single request/response conversation. Messenger (spec 4.A) wraps exactly one of
/// these; PASE/CASE handshakes and the interaction client each open their own.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn id(&self) -> u16;
    /// Send without waiting for a reply (acks, status reports).
    async fn send(&self, payload: &[u8]) -> Result<()>;
    /// Send and wait for the next message addressed to this exchange.
    async fn request(&self, payload: &[u8]) -> Result<Message>;
    /// Wait for the next message on this exchange without sending first (used mid
    /// handshake, e.g. waiting for sigma2 after sigma1 was sent standalone).
    async fn recv(&self) -> Result<Message>;
}

/// Opens exchanges over an established (encrypted or not) session, and surfaces
/// messages that arrive with no matching open exchange as subscription events.
#[async_trait]
pub trait ExchangeProvider: Send + Sync {
    async fn open_exchange(&self) -> Result<Arc<dyn Exchange>>;
    async fn open_exchange_with_id(&self, exchange_id: u16) -> Result<Arc<dyn Exchange>>;
    /// Next message that arrived on an exchange nobody opened (e.g. a DataReport
    /// pushed for an active subscription).
    async fn next_unsolicited(&self) -> Option<Message>;
}

struct UnackedMessage {
    data: Vec<u8>,
    original_time: Instant,
    last_sent: Instant,
}

struct ReceivedCounters {
    set: HashSet<u32>,
    order: VecDeque<u32>,
    max_size: usize,
}

impl ReceivedCounters {
    fn new(max_size: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            max_size,
        }
    }
    fn insert(&mut self, counter: u32) -> bool {
        if !self.set.insert(counter) {
            return false;
        }
        self.order.push_back(counter);
        while self.order.len() > self.max_size {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

struct Shared {
    wire: Arc<dyn Wire>,
    session: Mutex<Session>,
    pending: std::sync::Mutex<HashMap<u16, oneshot::Sender<Message>>>,
    unacked: Mutex<HashMap<u32, UnackedMessage>>,
    received: std::sync::Mutex<ReceivedCounters>,
    events_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

/// [ExchangeProvider] backed by a [Wire], spawning one background task that decrypts,
/// de-duplicates, acks, and routes incoming datagrams either to a waiting exchange or
/// to the unsolicited-events queue. Use [ExchangeProviderImpl::new_udp] for a real
/// connection, or [ExchangeProviderImpl::new] with a [LoopbackWire] half in tests.
pub struct ExchangeProviderImpl {
    shared: Arc<Shared>,
    events_rx: Mutex<mpsc::Receiver<Message>>,
}

impl ExchangeProviderImpl {
    pub fn new(wire: Arc<dyn Wire>, session: Session) -> Self {
        let (events_tx, events_rx) = mpsc::channel(32);
        let shared = Arc::new(Shared {
            wire,
            session: Mutex::new(session),
            pending: std::sync::Mutex::new(HashMap::new()),
            unacked: Mutex::new(HashMap::new()),
            received: std::sync::Mutex::new(ReceivedCounters::new(MAX_CACHED_COUNTERS)),
            events_tx,
            cancel: CancellationToken::new(),
        });

        let read_loop_shared = shared.clone();
        tokio::spawn(async move {
            read_loop(read_loop_shared).await;
        });

        Self {
            shared,
            events_rx: Mutex::new(events_rx),
        }
    }

    pub fn new_udp(transport_conn: Arc<transport::Connection>, session: Session) -> Self {
        Self::new(transport_conn, session)
    }
}

#[async_trait]
impl ExchangeProvider for ExchangeProviderImpl {
    async fn open_exchange(&self) -> Result<Arc<dyn Exchange>> {
        self.open_exchange_with_id(rand::random()).await
    }

    async fn open_exchange_with_id(&self, exchange_id: u16) -> Result<Arc<dyn Exchange>> {
        Ok(Arc::new(WireExchange {
            id: exchange_id,
            shared: self.shared.clone(),
        }))
    }

    async fn next_unsolicited(&self) -> Option<Message> {
        let mut rx = self.events_rx.lock().await;
        rx.recv().await
    }
}

impl Drop for ExchangeProviderImpl {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

struct WireExchange {
    id: u16,
    shared: Arc<Shared>,
}

#[async_trait]
impl Exchange for WireExchange {
    fn id(&self) -> u16 {
        self.id
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        let encoded = {
            let mut session = self.shared.session.lock().await;
            session
                .encode_message(payload)
                .map_err(|e| MatterError::TransportError(e.to_string()))?
        };
        self.shared
            .wire
            .send(&encoded)
            .await
            .map_err(|e| MatterError::TransportError(e.to_string()))
    }

    async fn request(&self, payload: &[u8]) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        {
            self.shared.pending.lock().unwrap().insert(self.id, tx);
        }
        let encoded = {
            let mut session = self.shared.session.lock().await;
            session
                .encode_message(payload)
                .map_err(|e| MatterError::TransportError(e.to_string()))?
        };
        if let Ok((header, _)) = messages::MessageHeader::decode(&encoded) {
            let mut unacked = self.shared.unacked.lock().await;
            let now = Instant::now();
            unacked.insert(
                header.message_counter,
                UnackedMessage {
                    data: encoded.clone(),
                    original_time: now,
                    last_sent: now,
                },
            );
        }
        if let Err(e) = self.shared.wire.send(&encoded).await {
            self.shared.pending.lock().unwrap().remove(&self.id);
            return Err(MatterError::TransportError(e.to_string()));
        }
        rx.await.map_err(|_| MatterError::Timeout)
    }

    async fn recv(&self) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        {
            self.shared.pending.lock().unwrap().insert(self.id, tx);
        }
        rx.await.map_err(|_| MatterError::Timeout)
    }
}

async fn read_loop(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = shared.wire.receive(RECEIVE_POLL) => {
                match result {
                    Ok(data) => {
                        if let Err(e) = process_incoming(&shared, &data).await {
                            log::debug!("error processing incoming message: {:?}", e);
                        }
                    }
                    Err(_) => check_retransmit(&shared).await,
                }
            }
        }
    }
}

async fn process_incoming(shared: &Arc<Shared>, data: &[u8]) -> anyhow::Result<()> {
    let decoded_data = {
        let mut session = shared.session.lock().await;
        session.decode_message(data)?
    };
    let message = Message::decode(&decoded_data)?;

    if message.protocol_header.exchange_flags_ack() {
        shared
            .unacked
            .lock()
            .await
            .remove(&message.protocol_header.ack_counter);
    }

    let is_new = shared
        .received
        .lock()
        .unwrap()
        .insert(message.message_header.message_counter);
    if !is_new {
        send_ack(shared, &message).await?;
        return Ok(());
    }
    if message.protocol_header.exchange_flags_reliability() {
        send_ack(shared, &message).await?;
    }

    if message.protocol_header.protocol_id == ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL
        && message.protocol_header.opcode == ProtocolMessageHeader::OPCODE_ACK
    {
        return Ok(());
    }

    let sender = {
        shared
            .pending
            .lock()
            .unwrap()
            .remove(&message.protocol_header.exchange_id)
    };
    match sender {
        Some(tx) => {
            let _ = tx.send(message);
        }
        None => {
            let _ = shared.events_tx.send(message).await;
        }
    }
    Ok(())
}

async fn send_ack(shared: &Arc<Shared>, message: &Message) -> anyhow::Result<()> {
    let ack = messages::ack(
        message.protocol_header.exchange_id,
        message.message_header.message_counter as i64,
    )?;
    let out = {
        let mut session = shared.session.lock().await;
        session.encode_message(&ack)?
    };
    shared.wire.send(&out).await?;
    Ok(())
}

async fn check_retransmit(shared: &Arc<Shared>) {
    let mut to_retransmit = Vec::new();
    {
        let mut unacked = shared.unacked.lock().await;
        let mut to_remove = Vec::new();
        for (counter, msg) in unacked.iter_mut() {
            let age = msg.original_time.elapsed();
            if age >= MAX_RETRANSMIT_AGE {
                to_remove.push(*counter);
            } else if msg.last_sent.elapsed() >= RETRANSMIT_THRESHOLD {
                to_retransmit.push(msg.data.clone());
                msg.last_sent = Instant::now();
            }
        }
        for counter in to_remove {
            unacked.remove(&counter);
        }
    }
    for data in to_retransmit {
        if let Err(e) = shared.wire.send(&data).await {
            log::debug!("retransmit failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked_sessions() -> (Session, Session) {
        let key_ab = [1u8; 16];
        let key_ba = [2u8; 16];
        let mut a = Session::new();
        let mut b = Session::new();
        a.set_encrypt_key(&key_ab);
        b.set_decrypt_key(&key_ab);
        b.set_encrypt_key(&key_ba);
        a.set_decrypt_key(&key_ba);
        a.remote_node = b.local_node.clone();
        b.remote_node = a.local_node.clone();
        (a, b)
    }

    #[tokio::test]
    async fn unsolicited_message_is_delivered_to_the_peer_event_queue() {
        let (wire_a, wire_b) = loopback_pair();
        let (session_a, session_b) = linked_sessions();
        let provider_a = ExchangeProviderImpl::new(Arc::new(wire_a), session_a);
        let provider_b = ExchangeProviderImpl::new(Arc::new(wire_b), session_b);

        let exchange = provider_a.open_exchange().await.expect("open exchange");
        let payload = messages::im_read_request(0, 6, 0).expect("read request");
        exchange.send(&payload).await.expect("send");

        let received = tokio::time::timeout(Duration::from_secs(2), provider_b.next_unsolicited())
            .await
            .expect("timed out waiting for message")
            .expect("peer event channel closed");
        assert_eq!(
            received.protocol_header.opcode,
            ProtocolMessageHeader::INTERACTION_OPCODE_READ_REQ
        );
    }

    #[tokio::test]
    async fn request_is_answered_by_a_reply_on_the_same_exchange_id() {
        let (wire_a, wire_b) = loopback_pair();
        let (session_a, session_b) = linked_sessions();
        let provider_a = ExchangeProviderImpl::new(Arc::new(wire_a), session_a);
        let provider_b = ExchangeProviderImpl::new(Arc::new(wire_b), session_b);

        let exchange_id = 0xabcd;
        let exchange_a = provider_a
            .open_exchange_with_id(exchange_id)
            .await
            .expect("open exchange");

        let request_fut = {
            let payload = messages::im_read_request_ex(0, 6, 0, exchange_id).expect("read request");
            exchange_a.request(&payload)
        };

        let responder = async {
            let request = provider_b
                .next_unsolicited()
                .await
                .expect("peer event channel closed");
            assert_eq!(request.protocol_header.exchange_id, exchange_id);
            let exchange_b = provider_b
                .open_exchange_with_id(exchange_id)
                .await
                .expect("open exchange");
            let reply = messages::status_report_ok(
                exchange_id,
                request.message_header.message_counter as i64,
                ProtocolMessageHeader::PROTOCOL_ID_INTERACTION as u32,
                0,
            )
            .expect("status report");
            exchange_b.send(&reply).await.expect("send reply");
        };

        let (reply, _) = tokio::join!(request_fut, responder);
        let reply = reply.expect("request should resolve");
        assert_eq!(reply.protocol_header.opcode, ProtocolMessageHeader::OPCODE_STATUS);
        assert!(reply.status_report_info.expect("status info").is_ok());
    }
}
