//! Subscription receiver: dispatches inbound `DataReport` frames to listeners
//! registered by `InteractionClient::subscribe`/`subscribeMultipleAttributes`
//! (spec 4.D).
//!
//! One `SubscriptionReceiver` is shared across every `InteractionClient` built on
//! the same session/exchange substrate rather than registered per client (see
//! SPEC_FULL.md §9 "Shared SubscriptionReceiver across sessions"): listeners are
//! keyed by `(session_id, subscription_id)` in one process-wide registry, and a
//! single background task drains the `ExchangeProvider`'s unsolicited queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{MatterError, Result};
use crate::exchange::{Exchange, ExchangeProvider};
use crate::messages::{AttributeReport, DataReport, ProtocolMessageHeader};
use crate::messenger::{Messenger, RawMessage};

const IM_STATUS_SUCCESS: u32 = 0x00;
const IM_STATUS_INVALID_SUBSCRIPTION: u32 = 0x7d;

/// Invoked once per `AttributeReport` entry of every `DataReport` delivered for a
/// subscription. Run synchronously on the dispatch task; a listener that fails is
/// logged and does not affect other subscriptions.
pub type Listener = Box<dyn Fn(&AttributeReport) + Send + Sync>;

/// A registered listener plus the report-arity this subscription expects, per
/// spec 4.E: a single-attribute `subscribe` expects exactly one entry per report
/// (`Some(1)`); `subscribeMultipleAttributes` accepts any number, including zero
/// (`None`).
struct Registered {
    expected_count: Option<usize>,
    listener: Listener,
}

/// Registry of active subscription listeners, shared across `InteractionClient`s
/// on the same session.
#[derive(Default)]
pub struct SubscriptionReceiver {
    listeners: Mutex<HashMap<(u16, u32), Registered>>,
}

impl SubscriptionReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install (or replace — duplicates overwrite, per SPEC_FULL.md §3) the listener
    /// for `(session_id, subscription_id)`. Must be called before the peer can send a
    /// report for this subscription, i.e. after `SubscribeResponse` is received and
    /// before any further exchange on this session (see SPEC_FULL.md §5).
    ///
    /// `expected_count` is `Some(1)` for a single-attribute subscription (spec 4.E
    /// "requires exactly one entry for single-attribute subscribe (else raise)") and
    /// `None` for `subscribeMultipleAttributes`, which tolerates any entry count.
    pub fn register(&self, session_id: u16, subscription_id: u32, expected_count: Option<usize>, listener: Listener) {
        self.listeners
            .lock()
            .expect("subscription registry lock poisoned")
            .insert((session_id, subscription_id), Registered { expected_count, listener });
    }

    pub fn unregister(&self, session_id: u16, subscription_id: u32) {
        self.listeners
            .lock()
            .expect("subscription registry lock poisoned")
            .remove(&(session_id, subscription_id));
    }

    /// Handle one already-opened interaction-protocol exchange carrying a `DataReport`:
    /// decode it, look up the listener, reply with a status, and invoke the listener
    /// once per report entry.
    async fn handle(&self, session_id: u16, exchange: Arc<dyn Exchange>, first: RawMessage) -> Result<()> {
        let messenger = Messenger::new(exchange);
        if first.protocol_id != ProtocolMessageHeader::PROTOCOL_ID_INTERACTION
            || first.opcode != ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA
        {
            return Err(MatterError::ProtocolMismatch {
                expected: ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA,
                got: first.opcode,
            });
        }

        let report = DataReport::decode(&first.tlv)?;
        let subscription_id = match report.subscription_id {
            Some(id) => id,
            None => {
                messenger
                    .send_status(
                        ProtocolMessageHeader::PROTOCOL_ID_INTERACTION as u32,
                        IM_STATUS_INVALID_SUBSCRIPTION,
                    )
                    .await?;
                return Err(MatterError::InvalidSubscription);
            }
        };

        let key = (session_id, subscription_id);
        let has_listener = self
            .listeners
            .lock()
            .expect("subscription registry lock poisoned")
            .contains_key(&key);
        if !has_listener {
            messenger
                .send_status(
                    ProtocolMessageHeader::PROTOCOL_ID_INTERACTION as u32,
                    IM_STATUS_INVALID_SUBSCRIPTION,
                )
                .await?;
            return Err(MatterError::InvalidSubscription);
        }

        if !report.suppress_response {
            messenger
                .send_status(ProtocolMessageHeader::PROTOCOL_ID_INTERACTION as u32, IM_STATUS_SUCCESS)
                .await?;
        }

        self.dispatch(session_id, subscription_id, &report.reports);
        Ok(())
    }

    /// Invoke the registered listener once per report entry. Exposed separately from
    /// `handle` so an `InteractionClient`'s `subscribe`/`subscribeMultipleAttributes`
    /// can feed the initial report through the same path synchronously (SPEC_FULL.md
    /// 4.E: "Feed the initial report through the listener synchronously").
    ///
    /// A report batch that violates this subscription's declared arity (spec 4.E
    /// "(a) validates the report is non-empty" / "(c) requires exactly one entry for
    /// single-attribute subscribe (else raise)") is logged and dropped rather than
    /// dispatched — the same "log and continue" policy spec 4.D applies to listener
    /// failures, since a report delivered off the background receiver has no caller
    /// left to raise to.
    pub fn dispatch(&self, session_id: u16, subscription_id: u32, reports: &[AttributeReport]) {
        let listeners = self.listeners.lock().expect("subscription registry lock poisoned");
        if let Some(registered) = listeners.get(&(session_id, subscription_id)) {
            if let Some(expected) = registered.expected_count {
                if reports.len() != expected {
                    log::warn!(
                        "subscription {} expected {} report entr{}, got {}: dropping report",
                        subscription_id,
                        expected,
                        if expected == 1 { "y" } else { "ies" },
                        reports.len()
                    );
                    return;
                }
            }
            for report in reports {
                (registered.listener)(report);
            }
        }
    }

    /// Same arity check as `dispatch`, but surfaced as an error instead of logged —
    /// for the initial report, which is fed through synchronously and still has a
    /// caller (`InteractionClient::subscribe`/`subscribeMultipleAttributes`) able to
    /// raise it (spec 4.E "(a)"/"(c)").
    pub(crate) fn check_arity(expected_count: Option<usize>, reports: &[AttributeReport]) -> Result<()> {
        if let Some(expected) = expected_count {
            if reports.len() != expected {
                return Err(MatterError::UnexpectedReport(format!(
                    "expected exactly {} report entr{} for a single-attribute subscribe, got {}",
                    expected,
                    if expected == 1 { "y" } else { "ies" },
                    reports.len()
                )));
            }
        }
        Ok(())
    }

    /// Background dispatch loop: drains `provider`'s unsolicited queue, treating every
    /// inbound interaction-protocol exchange as a subscription report. Runs until the
    /// provider's unsolicited channel closes (the underlying Exchange substrate shut
    /// down). A handling error is logged and does not stop the loop.
    pub async fn run(self: Arc<Self>, session_id: u16, provider: Arc<dyn ExchangeProvider>) {
        loop {
            let message = match provider.next_unsolicited().await {
                Some(m) => m,
                None => {
                    log::debug!("subscription receiver: exchange substrate closed, stopping");
                    return;
                }
            };
            if message.protocol_header.protocol_id != ProtocolMessageHeader::PROTOCOL_ID_INTERACTION {
                continue;
            }
            let exchange_id = message.protocol_header.exchange_id;
            let exchange = match provider.open_exchange_with_id(exchange_id).await {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("subscription receiver: could not open exchange {}: {}", exchange_id, e);
                    continue;
                }
            };
            let raw: RawMessage = message.into();
            if let Err(e) = self.handle(session_id, exchange, raw).await {
                log::warn!("subscription receiver: dropping bad report: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{loopback_pair, ExchangeProviderImpl};
    use crate::session::Session;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn linked_sessions() -> (Session, Session) {
        let key_ab = [7u8; 16];
        let key_ba = [8u8; 16];
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

    fn build_report(subscription_id: u32, endpoint: u16, value: bool) -> Vec<u8> {
        use crate::tlv::TlvBuffer;
        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct().unwrap();
        tlv.write_uint32(0, subscription_id).unwrap();
        tlv.write_array(1).unwrap();
        tlv.write_anon_struct().unwrap();
        tlv.write_struct(1).unwrap(); // AttributeDataIB
        tlv.write_uint32(0, 1).unwrap(); // data version
        tlv.write_list(1).unwrap(); // Path
        tlv.write_uint16(2, endpoint).unwrap();
        tlv.write_uint32(3, 6).unwrap();
        tlv.write_uint32(4, 0).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_bool(2, value).unwrap(); // Data (tag 2)
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_bool(3, false).unwrap(); // moreChunkedMessages
        tlv.write_bool(4, false).unwrap(); // suppressResponse
        tlv.write_struct_end().unwrap();
        tlv.data
    }

    #[tokio::test]
    async fn report_for_a_registered_subscription_invokes_the_listener_and_replies_success() {
        let (wire_a, wire_b) = loopback_pair();
        let (session_a, session_b) = linked_sessions();
        let provider_a = Arc::new(ExchangeProviderImpl::new(Arc::new(wire_a), session_a));
        let provider_b = ExchangeProviderImpl::new(Arc::new(wire_b), session_b);

        let receiver = SubscriptionReceiver::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        receiver.register(
            0,
            42,
            Some(1),
            Box::new(move |_report| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let dispatch = tokio::spawn(receiver.clone().run(0, provider_a));

        let exchange_id = 0x9911;
        let exchange_b = provider_b
            .open_exchange_with_id(exchange_id)
            .await
            .expect("open exchange");
        let prot = crate::messages::interaction_header(
            ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA,
            exchange_id,
            -1,
            true,
        );
        let mut payload = prot.encode().expect("encode header");
        payload.extend_from_slice(&build_report(42, 1, true));
        exchange_b.send(&payload).await.expect("send report");

        let reply = exchange_b.recv().await.expect("status reply");
        assert_eq!(reply.protocol_header.opcode, ProtocolMessageHeader::OPCODE_STATUS);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        dispatch.abort();
    }

    #[tokio::test]
    async fn report_for_an_unknown_subscription_is_rejected() {
        let (wire_a, wire_b) = loopback_pair();
        let (session_a, session_b) = linked_sessions();
        let provider_a = Arc::new(ExchangeProviderImpl::new(Arc::new(wire_a), session_a));
        let provider_b = ExchangeProviderImpl::new(Arc::new(wire_b), session_b);

        let receiver = SubscriptionReceiver::new();
        let dispatch = tokio::spawn(receiver.clone().run(0, provider_a));

        let exchange_id = 0x9912;
        let exchange_b = provider_b
            .open_exchange_with_id(exchange_id)
            .await
            .expect("open exchange");
        let prot = crate::messages::interaction_header(
            ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA,
            exchange_id,
            -1,
            true,
        );
        let mut payload = prot.encode().expect("encode header");
        payload.extend_from_slice(&build_report(999, 1, true));
        exchange_b.send(&payload).await.expect("send report");

        let reply = exchange_b.recv().await.expect("status reply");
        let info = reply.status_report_info.expect("status report info");
        assert_eq!(info.protocol_code, IM_STATUS_INVALID_SUBSCRIPTION);
        dispatch.abort();
    }
}
