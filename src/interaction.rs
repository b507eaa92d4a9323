//! Interaction Protocol client: read/write/subscribe/invoke against a device's
//! data model over an already-established session (spec 4.E).
//!
//! One `InteractionClient` is built per session and shares its `SubscriptionReceiver`
//! with every other client on the same `ExchangeProvider` (SPEC_FULL.md §9 "Shared
//! SubscriptionReceiver across sessions"), so a subscription installed by one call
//! keeps being dispatched for the lifetime of the session regardless of which
//! `InteractionClient` handle the caller is holding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::datamodel::{attribute_value_from_report, AttributeValue};
use crate::error::{MatterError, Result};
use crate::exchange::ExchangeProvider;
use crate::messages::{
    self, AttributePath, AttributeReport, DataReport, InvokeResponseItem, ProtocolMessageHeader,
    WriteItem, WriteStatus,
};
use crate::messenger::Messenger;
use crate::subscription::{Listener, SubscriptionReceiver};
use crate::tlv::TlvItem;

const IM_STATUS_SUCCESS: u32 = 0x00;

/// Key into the local attribute cache: `(endpointId, clusterId, attributeId)`.
/// Wildcards never get cached, so unlike [AttributePath] every field is concrete.
type CacheKey = (u16, u32, u32);

pub struct InteractionClient {
    exchanges: Arc<dyn ExchangeProvider>,
    session_id: u16,
    subscriptions: Arc<SubscriptionReceiver>,
    cache: Arc<Mutex<HashMap<CacheKey, (AttributeValue, Option<u32>)>>>,
}

impl InteractionClient {
    pub fn new(
        exchanges: Arc<dyn ExchangeProvider>,
        session_id: u16,
        subscriptions: Arc<SubscriptionReceiver>,
    ) -> Self {
        Self {
            exchanges,
            session_id,
            subscriptions,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn open_messenger(&self) -> Result<(Messenger, u16)> {
        let exchange = self.exchanges.open_exchange().await?;
        let exchange_id = exchange.id();
        Ok((Messenger::new(exchange), exchange_id))
    }

    /// `getAllAttributes()`: read the wildcard `(*, *, *)` path.
    pub async fn get_all_attributes(&self) -> Result<Vec<AttributeReport>> {
        self.get_multiple_attributes(&[AttributePath::wildcard()]).await
    }

    /// `getMultipleAttributes(paths)`: reassembles a chunked `DataReport` stream,
    /// acknowledging every non-suppressed chunk, until `moreChunkedMessages` clears.
    pub async fn get_multiple_attributes(&self, paths: &[AttributePath]) -> Result<Vec<AttributeReport>> {
        let (messenger, exchange_id) = self.open_messenger().await?;
        let request = messages::im_read_request_multi(paths, exchange_id, true)
            .map_err(|e| MatterError::ProtocolError(e.to_string()))?;

        let mut reports = Vec::new();
        let mut raw = messenger.request(&request).await?;
        loop {
            if raw.protocol_id != ProtocolMessageHeader::PROTOCOL_ID_INTERACTION
                || raw.opcode != ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA
            {
                return Err(MatterError::ProtocolMismatch {
                    expected: ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA,
                    got: raw.opcode,
                });
            }
            let report = DataReport::decode(&raw.tlv).map_err(|e| MatterError::ProtocolError(e.to_string()))?;
            let more = report.more_chunked_messages;
            let suppress = report.suppress_response;
            reports.extend(report.reports);

            if !suppress {
                messenger
                    .send_status(ProtocolMessageHeader::PROTOCOL_ID_INTERACTION as u32, IM_STATUS_SUCCESS)
                    .await?;
            }
            if !more {
                break;
            }
            raw = messenger.read().await?;
        }
        Ok(reports)
    }

    /// `get(endpointId, clusterId, attribute)`: cache read-through, falling back to a
    /// single-path read. More than one report in the reply is a protocol violation.
    pub async fn get(
        &self,
        endpoint: u16,
        cluster: u32,
        attribute: u32,
    ) -> Result<(AttributeValue, Option<u32>)> {
        let key: CacheKey = (endpoint, cluster, attribute);
        if let Some(cached) = self
            .cache
            .lock()
            .expect("attribute cache lock poisoned")
            .get(&key)
        {
            return Ok(cached.clone());
        }

        let path = AttributePath::new(endpoint, cluster, attribute);
        let mut reports = self.get_multiple_attributes(&[path]).await?;
        if reports.len() != 1 {
            return Err(MatterError::UnexpectedReport(format!(
                "expected exactly one report for a single-attribute read, got {}",
                reports.len()
            )));
        }
        let report = reports.remove(0);
        if let Some((code, cluster_code)) = report.status {
            return Err(MatterError::StatusResponseError(cluster_code.unwrap_or(code)));
        }
        let value = attribute_value_from_report(&report)?;
        Ok((value, report.data_version))
    }

    /// `set(...)`: a single-item `setMultipleAttributes`, surfacing any failure as
    /// `WriteFailed` with the attribute path attached. Never touches the cache.
    pub async fn set(
        &self,
        endpoint: u16,
        cluster: u32,
        attribute: u32,
        data_tag2: Vec<u8>,
        expected_data_version: Option<u32>,
    ) -> Result<()> {
        let path = AttributePath::new(endpoint, cluster, attribute);
        let item = WriteItem {
            path: path.clone(),
            data_tag2,
            expected_data_version,
        };
        let mut failures = self.set_multiple_attributes(vec![item]).await?;
        if let Some(failure) = failures.pop() {
            return Err(MatterError::WriteFailed {
                path,
                code: failure.cluster_code.unwrap_or(failure.code),
            });
        }
        Ok(())
    }

    /// `setMultipleAttributes(items)`: returns only the entries whose status was not
    /// Success.
    pub async fn set_multiple_attributes(&self, items: Vec<WriteItem>) -> Result<Vec<WriteStatus>> {
        let (messenger, exchange_id) = self.open_messenger().await?;
        let request = messages::im_write_request_multi(&items, exchange_id, false)
            .map_err(|e| MatterError::ProtocolError(e.to_string()))?;
        let raw = messenger.request(&request).await?;
        if raw.protocol_id != ProtocolMessageHeader::PROTOCOL_ID_INTERACTION
            || raw.opcode != ProtocolMessageHeader::INTERACTION_OPCODE_WRITE_RESP
        {
            return Err(MatterError::ProtocolMismatch {
                expected: ProtocolMessageHeader::INTERACTION_OPCODE_WRITE_RESP,
                got: raw.opcode,
            });
        }
        let statuses = messages::decode_write_response(&raw.tlv);
        Ok(statuses.into_iter().filter(|s| s.code != IM_STATUS_SUCCESS).collect())
    }

    /// `subscribe(...)`: single-path convenience wrapper over
    /// `subscribeMultipleAttributes`.
    pub async fn subscribe(
        &self,
        endpoint: u16,
        cluster: u32,
        attribute: u32,
        min_interval_s: u16,
        max_interval_s: u16,
        listener: Option<Listener>,
    ) -> Result<u32> {
        self.subscribe_attributes_inner(
            &[AttributePath::new(endpoint, cluster, attribute)],
            min_interval_s,
            max_interval_s,
            listener,
            Some(1),
        )
        .await
    }

    /// `subscribeMultipleAttributes(...)`: installs a listener that updates the local
    /// cache before invoking the caller's `listener`, then feeds the initial report
    /// through that same listener synchronously (SPEC_FULL.md 4.E). Accepts any
    /// number of reported entries, including zero.
    pub async fn subscribe_multiple_attributes(
        &self,
        paths: &[AttributePath],
        min_interval_s: u16,
        max_interval_s: u16,
        listener: Option<Listener>,
    ) -> Result<u32> {
        self.subscribe_attributes_inner(paths, min_interval_s, max_interval_s, listener, None)
            .await
    }

    /// Shared implementation for `subscribe`/`subscribeMultipleAttributes`.
    /// `expected_count` is `Some(1)` for the single-attribute case (spec 4.E
    /// "(a) validates the report is non-empty" / "(c) requires exactly one entry ...
    /// (else raise)") and `None` for the multi-attribute case, which tolerates any
    /// entry count.
    async fn subscribe_attributes_inner(
        &self,
        paths: &[AttributePath],
        min_interval_s: u16,
        max_interval_s: u16,
        listener: Option<Listener>,
        expected_count: Option<usize>,
    ) -> Result<u32> {
        let (messenger, exchange_id) = self.open_messenger().await?;
        let request = messages::im_subscribe_request_multi(
            paths,
            exchange_id,
            min_interval_s,
            max_interval_s,
            true,
            true,
        )
        .map_err(|e| MatterError::ProtocolError(e.to_string()))?;

        let initial = messenger.request(&request).await?;
        if initial.protocol_id != ProtocolMessageHeader::PROTOCOL_ID_INTERACTION
            || initial.opcode != ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA
        {
            return Err(MatterError::ProtocolMismatch {
                expected: ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA,
                got: initial.opcode,
            });
        }
        let initial_report =
            DataReport::decode(&initial.tlv).map_err(|e| MatterError::ProtocolError(e.to_string()))?;
        crate::subscription::SubscriptionReceiver::check_arity(expected_count, &initial_report.reports)?;
        if !initial_report.suppress_response {
            messenger
                .send_status(ProtocolMessageHeader::PROTOCOL_ID_INTERACTION as u32, IM_STATUS_SUCCESS)
                .await?;
        }

        let confirm = messenger
            .expect_opcode(
                ProtocolMessageHeader::PROTOCOL_ID_INTERACTION,
                ProtocolMessageHeader::INTERACTION_OPCODE_SUBSCRIBE_RESP,
            )
            .await?;
        let info = messages::decode_subscribe_response(&confirm.tlv)
            .ok_or_else(|| MatterError::ProtocolError("missing SubscribeResponse".to_string()))?;

        let cache = self.cache.clone();
        let subscription_id = info.subscription_id;
        let installed: Listener = Box::new(move |report: &AttributeReport| {
            if let Some((code, cluster_code)) = report.status {
                log::warn!(
                    "subscription {} report carried a status for {:?}: {:#x}",
                    subscription_id,
                    report.path,
                    cluster_code.unwrap_or(code)
                );
                return;
            }
            let value = match attribute_value_from_report(report) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("subscription {} dropped an unreadable report: {}", subscription_id, e);
                    return;
                }
            };
            if let (Some(endpoint), Some(cluster), Some(attribute)) =
                (report.path.endpoint, report.path.cluster, report.path.attribute)
            {
                cache
                    .lock()
                    .expect("attribute cache lock poisoned")
                    .insert((endpoint, cluster, attribute), (value, report.data_version));
            }
            if let Some(listener) = listener.as_ref() {
                listener(report);
            }
        });
        self.subscriptions
            .register(self.session_id, subscription_id, expected_count, installed);
        self.subscriptions
            .dispatch(self.session_id, subscription_id, &initial_report.reports);
        Ok(subscription_id)
    }

    /// `invoke(...)`: encode and send a single command, return its response payload
    /// (if any). `respSchema_is_no_response` is true when the caller's `respSchema`
    /// is `NoResponse` (spec 4.E): a bare `Success` result then decodes as unit
    /// instead of requiring a `response` entry. `optional` controls whether a reply
    /// carrying neither a response nor a result entry is tolerated.
    pub async fn invoke(
        &self,
        endpoint: u16,
        cluster: u32,
        command: u32,
        request_tlv: &[u8],
        respschema_is_no_response: bool,
        optional: bool,
    ) -> Result<Option<TlvItem>> {
        self.invoke_inner(endpoint, cluster, command, request_tlv, respschema_is_no_response, optional, None)
            .await
    }

    /// `invoke_timed(...)`: as `invoke`, but first runs a `TimedRequest`/
    /// `StatusResponse` round trip on the same exchange to open the timed-interaction
    /// window before sending the invoke itself.
    pub async fn invoke_timed(
        &self,
        endpoint: u16,
        cluster: u32,
        command: u32,
        request_tlv: &[u8],
        respschema_is_no_response: bool,
        optional: bool,
        timeout_ms: u16,
    ) -> Result<Option<TlvItem>> {
        self.invoke_inner(
            endpoint,
            cluster,
            command,
            request_tlv,
            respschema_is_no_response,
            optional,
            Some(timeout_ms),
        )
        .await
    }

    async fn invoke_inner(
        &self,
        endpoint: u16,
        cluster: u32,
        command: u32,
        request_tlv: &[u8],
        respschema_is_no_response: bool,
        optional: bool,
        timeout_ms: Option<u16>,
    ) -> Result<Option<TlvItem>> {
        let (messenger, exchange_id) = self.open_messenger().await?;
        let timed = timeout_ms.is_some();

        if let Some(timeout_ms) = timeout_ms {
            let timed_request = messages::im_timed_request(exchange_id, timeout_ms)
                .map_err(|e| MatterError::ProtocolError(e.to_string()))?;
            let ack = messenger.request(&timed_request).await?;
            if ack.protocol_id != ProtocolMessageHeader::PROTOCOL_ID_INTERACTION
                || ack.opcode != ProtocolMessageHeader::INTERACTION_OPCODE_STATUS_RESPONSE
            {
                return Err(MatterError::ProtocolMismatch {
                    expected: ProtocolMessageHeader::INTERACTION_OPCODE_STATUS_RESPONSE,
                    got: ack.opcode,
                });
            }
            let status = ack.tlv.get_u32(&[0]).unwrap_or(1);
            if status != IM_STATUS_SUCCESS {
                return Err(MatterError::StatusResponseError(status));
            }
        }

        let request = messages::im_invoke_request(endpoint, cluster, command, exchange_id, request_tlv, timed)
            .map_err(|e| MatterError::ProtocolError(e.to_string()))?;
        let raw = messenger.request(&request).await?;
        if raw.protocol_id != ProtocolMessageHeader::PROTOCOL_ID_INTERACTION
            || raw.opcode != ProtocolMessageHeader::INTERACTION_OPCODE_INVOKE_RESP
        {
            return Err(MatterError::ProtocolMismatch {
                expected: ProtocolMessageHeader::INTERACTION_OPCODE_INVOKE_RESP,
                got: raw.opcode,
            });
        }

        match messages::decode_invoke_response(&raw.tlv).into_iter().next() {
            Some(InvokeResponseItem::Result { code, cluster_code, .. }) => {
                if code != IM_STATUS_SUCCESS {
                    return Err(MatterError::InvokeError(cluster_code.unwrap_or(code)));
                }
                // spec 4.E: a bare Success result only decodes as unit when the
                // caller's respSchema is NoResponse; otherwise it's "no response
                // entry", tolerated only if the command itself is optional.
                if respschema_is_no_response || optional {
                    Ok(None)
                } else {
                    Err(MatterError::ProtocolError(
                        "invoke expected a typed response but peer sent a bare success result".to_string(),
                    ))
                }
            }
            Some(InvokeResponseItem::Response { data, .. }) => Ok(Some(data)),
            None if optional => Ok(None),
            None => Err(MatterError::ProtocolError("no response nor result".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{loopback_pair, Exchange, ExchangeProviderImpl};
    use crate::session::Session;
    use crate::tlv::{TlvBuffer, TlvItemValue};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn linked_sessions() -> (Session, Session) {
        let key_ab = [3u8; 16];
        let key_ba = [4u8; 16];
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

    fn build_data_report(endpoint: u16, cluster: u32, attribute: u32, value: bool, more: bool) -> Vec<u8> {
        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct().unwrap();
        tlv.write_array(1).unwrap();
        tlv.write_anon_struct().unwrap();
        tlv.write_struct(1).unwrap();
        tlv.write_uint32(0, 1).unwrap();
        tlv.write_list(1).unwrap();
        tlv.write_uint16(2, endpoint).unwrap();
        tlv.write_uint32(3, cluster).unwrap();
        tlv.write_uint32(4, attribute).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_bool(2, value).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_bool(3, more).unwrap();
        tlv.write_bool(4, false).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.data
    }

    async fn respond_to_read(provider: &ExchangeProviderImpl, payload: Vec<u8>) {
        let request = provider.next_unsolicited().await.expect("read request");
        let exchange_id = request.protocol_header.exchange_id;
        let exchange = provider
            .open_exchange_with_id(exchange_id)
            .await
            .expect("open exchange");
        let prot = crate::messages::interaction_header(
            ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA,
            exchange_id,
            request.message_header.message_counter as i64,
            true,
        );
        let mut b = prot.encode().expect("encode header");
        b.extend_from_slice(&payload);
        exchange.send(&b).await.expect("send report");

        let status = exchange.recv().await.expect("status ack");
        assert_eq!(status.protocol_header.opcode, ProtocolMessageHeader::OPCODE_STATUS);
    }

    #[tokio::test]
    async fn get_returns_cached_value_without_a_network_round_trip() {
        let (wire_a, _wire_b) = loopback_pair();
        let (session_a, _session_b) = linked_sessions();
        let provider_a = Arc::new(ExchangeProviderImpl::new(Arc::new(wire_a), session_a));
        let subscriptions = SubscriptionReceiver::new();
        let client = InteractionClient::new(provider_a, 0, subscriptions);

        client
            .cache
            .lock()
            .unwrap()
            .insert((1, 6, 0), (AttributeValue::Present(TlvItem { tag: 2, value: TlvItemValue::Bool(true) }), Some(7)));

        let (value, version) = client.get(1, 6, 0).await.expect("cached get");
        assert!(matches!(value, AttributeValue::Present(_)));
        assert_eq!(version, Some(7));
    }

    #[tokio::test]
    async fn get_all_attributes_concatenates_chunked_reports() {
        let (wire_a, wire_b) = loopback_pair();
        let (session_a, session_b) = linked_sessions();
        let provider_a = Arc::new(ExchangeProviderImpl::new(Arc::new(wire_a), session_a));
        let provider_b = ExchangeProviderImpl::new(Arc::new(wire_b), session_b);
        let subscriptions = SubscriptionReceiver::new();
        let client = InteractionClient::new(provider_a, 0, subscriptions);

        let responder = async {
            respond_to_read(&provider_b, build_data_report(1, 6, 0, false, true)).await;
            respond_to_read(&provider_b, build_data_report(1, 6, 1, true, false)).await;
        };

        let (reports, _) = tokio::join!(client.get_all_attributes(), responder);
        let reports = reports.expect("get all attributes");
        assert_eq!(reports.len(), 2);
    }

    #[tokio::test]
    async fn subscribe_feeds_the_initial_report_through_the_listener_and_populates_the_cache() {
        let (wire_a, wire_b) = loopback_pair();
        let (session_a, session_b) = linked_sessions();
        let provider_a = Arc::new(ExchangeProviderImpl::new(Arc::new(wire_a), session_a));
        let provider_b = ExchangeProviderImpl::new(Arc::new(wire_b), session_b);
        let subscriptions = SubscriptionReceiver::new();
        let client = InteractionClient::new(provider_a, 0, subscriptions);

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let responder = async {
            let request = provider_b.next_unsolicited().await.expect("subscribe request");
            let exchange_id = request.protocol_header.exchange_id;
            let exchange = provider_b
                .open_exchange_with_id(exchange_id)
                .await
                .expect("open exchange");

            let report_prot = crate::messages::interaction_header(
                ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA,
                exchange_id,
                request.message_header.message_counter as i64,
                true,
            );
            let mut report_bytes = report_prot.encode().expect("encode header");
            report_bytes.extend_from_slice(&build_data_report(1, 6, 0, true, false));
            crate::exchange::Exchange::send(exchange.as_ref(), &report_bytes)
                .await
                .expect("send report");

            let ack = crate::exchange::Exchange::recv(exchange.as_ref()).await.expect("status ack");

            let mut resp_tlv = TlvBuffer::new();
            resp_tlv.write_anon_struct().unwrap();
            resp_tlv.write_uint32(0, 77).unwrap();
            resp_tlv.write_uint16(1, 30).unwrap();
            resp_tlv.write_struct_end().unwrap();
            let resp_prot = crate::messages::interaction_header(
                ProtocolMessageHeader::INTERACTION_OPCODE_SUBSCRIBE_RESP,
                exchange_id,
                ack.message_header.message_counter as i64,
                true,
            );
            let mut resp_bytes = resp_prot.encode().expect("encode header");
            resp_bytes.extend_from_slice(&resp_tlv.data);
            crate::exchange::Exchange::send(exchange.as_ref(), &resp_bytes)
                .await
                .expect("send subscribe response");
        };

        let subscribe = client.subscribe(
            1,
            6,
            0,
            1,
            30,
            Some(Box::new(move |_report| {
                fired_clone.store(true, Ordering::SeqCst);
            })),
        );

        let (subscription_id, _) = tokio::join!(subscribe, responder);
        let subscription_id = subscription_id.expect("subscribe");
        assert_eq!(subscription_id, 77);
        assert!(fired.load(Ordering::SeqCst));

        let (value, version) = client.get(1, 6, 0).await.expect("cached get after subscribe");
        assert!(matches!(value, AttributeValue::Present(_)));
        assert_eq!(version, Some(1));
    }
}
