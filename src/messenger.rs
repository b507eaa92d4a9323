//! Messenger: wraps one [Exchange] and exposes typed send/read helpers for a
//! single handshake or interaction protocol conversation (spec 4.A).
//!
//! PASE, CASE and the Interaction Client each open their own Exchange and wrap it
//! in a Messenger for the lifetime of that handshake/request; `close()` releases
//! the Exchange and is safe to call more than once.

use std::sync::Arc;

use crate::error::{MatterError, Result};
use crate::exchange::Exchange;
use crate::messages::{Message, ProtocolMessageHeader, StatusReportInfo};
use crate::tlv::TlvItem;

/// One inbound message, decoded just enough for callers to inspect its opcode
/// before deciding how to parse the rest.
pub struct RawMessage {
    pub protocol_id: u16,
    pub opcode: u8,
    pub exchange_id: u16,
    pub message_counter: u32,
    pub payload: Vec<u8>,
    pub tlv: TlvItem,
    pub status_report_info: Option<StatusReportInfo>,
}

impl From<Message> for RawMessage {
    fn from(m: Message) -> Self {
        Self {
            protocol_id: m.protocol_header.protocol_id,
            opcode: m.protocol_header.opcode,
            exchange_id: m.protocol_header.exchange_id,
            message_counter: m.message_header.message_counter,
            payload: m.payload,
            tlv: m.tlv,
            status_report_info: m.status_report_info,
        }
    }
}

/// Wraps a single [Exchange] for the duration of a handshake or request/response
/// conversation. `close()` drops the held exchange reference; safe to call twice.
pub struct Messenger {
    exchange: Option<Arc<dyn Exchange>>,
}

impl Messenger {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self {
            exchange: Some(exchange),
        }
    }

    pub fn exchange_id(&self) -> Option<u16> {
        self.exchange.as_ref().map(|e| e.id())
    }

    fn exchange(&self) -> Result<&Arc<dyn Exchange>> {
        self.exchange
            .as_ref()
            .ok_or_else(|| MatterError::TransportError("messenger is closed".to_string()))
    }

    /// Send a pre-built wire message without waiting for a reply.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.exchange()?.send(payload).await
    }

    /// Send a pre-built wire message and wait for the next message on the same exchange.
    pub async fn request(&self, payload: &[u8]) -> Result<RawMessage> {
        let message = self.exchange()?.request(payload).await?;
        check_status(&message)?;
        Ok(message.into())
    }

    /// Wait for the next inbound message without sending anything first.
    pub async fn read(&self) -> Result<RawMessage> {
        let message = self.exchange()?.recv().await?;
        check_status(&message)?;
        Ok(message.into())
    }

    /// `read()`, then assert protocol id and opcode match what the caller expected.
    pub async fn expect_opcode(&self, protocol_id: u16, opcode: u8) -> Result<RawMessage> {
        let raw = self.read().await?;
        if raw.protocol_id != protocol_id || raw.opcode != opcode {
            return Err(MatterError::ProtocolMismatch {
                expected: opcode,
                got: raw.opcode,
            });
        }
        Ok(raw)
    }

    /// Send a `StatusReport` with the given general/protocol/code triple.
    pub async fn send_status(&self, protocol_id: u32, protocol_code: u32) -> Result<()> {
        let exchange_id = self.exchange()?.id();
        let status = crate::messages::status_report_ok(exchange_id, -1, protocol_id, protocol_code)
            .map_err(|e| MatterError::ProtocolError(e.to_string()))?;
        self.send(&status).await
    }

    /// Wait for a secure-channel `StatusReport` and confirm it is success (general code 0).
    pub async fn wait_for_success(&self) -> Result<()> {
        let raw = self.read().await?;
        match raw.status_report_info {
            Some(info) if info.is_ok() => Ok(()),
            Some(info) => Err(MatterError::StatusResponseError(info.protocol_code)),
            None => Err(MatterError::ProtocolError(
                "expected a StatusReport".to_string(),
            )),
        }
    }

    /// Release the held exchange. Idempotent.
    pub fn close(&mut self) {
        self.exchange = None;
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_status(message: &Message) -> Result<()> {
    if let Some(info) = &message.status_report_info {
        if !info.is_ok() {
            return Err(MatterError::StatusResponseError(info.protocol_code));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{loopback_pair, ExchangeProvider, ExchangeProviderImpl};
    use crate::session::Session;
    use std::time::Duration;

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
    async fn close_makes_further_sends_fail() {
        let (wire_a, _wire_b) = loopback_pair();
        let (session_a, _session_b) = linked_sessions();
        let provider_a = ExchangeProviderImpl::new(Arc::new(wire_a), session_a);
        let exchange = provider_a.open_exchange().await.expect("open exchange");
        let mut messenger = Messenger::new(exchange);
        messenger.close();
        assert!(messenger.send(&[1, 2, 3]).await.is_err());
    }

    #[tokio::test]
    async fn request_reply_round_trips_through_messenger() {
        let (wire_a, wire_b) = loopback_pair();
        let (session_a, session_b) = linked_sessions();
        let provider_a = ExchangeProviderImpl::new(Arc::new(wire_a), session_a);
        let provider_b = ExchangeProviderImpl::new(Arc::new(wire_b), session_b);

        let exchange_id = 0x55aa;
        let exchange_a = provider_a
            .open_exchange_with_id(exchange_id)
            .await
            .expect("open exchange");
        let messenger_a = Messenger::new(exchange_a);

        let request_fut = {
            let payload =
                crate::messages::im_read_request_ex(0, 6, 0, exchange_id).expect("read request");
            messenger_a.request(&payload)
        };
        let responder = async {
            let request = tokio::time::timeout(Duration::from_secs(2), provider_b.next_unsolicited())
                .await
                .expect("timeout")
                .expect("channel closed");
            let exchange_b = provider_b
                .open_exchange_with_id(exchange_id)
                .await
                .expect("open exchange");
            let reply = crate::messages::status_report_ok(
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
        assert_eq!(reply.opcode, ProtocolMessageHeader::OPCODE_STATUS);
    }
}
