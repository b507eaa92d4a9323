//! Cluster Facade (spec 4.F): a descriptor-driven binding layer over
//! [`InteractionClient`], not a new code path per cluster.
//!
//! A cluster is expressed as a set of `const` [`AttributeDescriptor`]/
//! [`CommandDescriptor`] values; [`ClusterBinding`] is a thin `(endpoint,
//! &InteractionClient)` wrapper with generic `get`/`set`/`subscribe`/`invoke`
//! methods keyed by those descriptors. Adding a cluster means adding descriptor
//! values (see the On/Off example below), never new binding code.

use std::marker::PhantomData;

use crate::datamodel::{self, AttributeValue};
use crate::error::Result;
use crate::interaction::InteractionClient;
use crate::subscription::Listener;
use crate::tlv::TlvItem;

/// Static metadata for one attribute: its `(cluster, attribute)` id pair plus how
/// to decode a wire value into `T` and encode `T` back for a write.
pub struct AttributeDescriptor<T> {
    pub cluster: u32,
    pub attribute: u32,
    pub decode: fn(&AttributeValue) -> Result<T>,
    pub encode: fn(T) -> Result<Vec<u8>>,
}

impl<T> AttributeDescriptor<T> {
    pub const fn new(
        cluster: u32,
        attribute: u32,
        decode: fn(&AttributeValue) -> Result<T>,
        encode: fn(T) -> Result<Vec<u8>>,
    ) -> Self {
        Self {
            cluster,
            attribute,
            decode,
            encode,
        }
    }
}

/// Static metadata for one command: its `(cluster, command)` id pair, whether a
/// missing response is tolerated (spec 4.E `invoke`'s `optional`), whether
/// `respSchema` is `NoResponse` (a bare `Success` result decodes as unit rather
/// than requiring a `response` entry), and how to encode the request / decode
/// the response payload.
pub struct CommandDescriptor<Req, Resp> {
    pub cluster: u32,
    pub command: u32,
    pub optional: bool,
    pub no_response: bool,
    pub encode_request: fn(&Req) -> Result<Vec<u8>>,
    pub decode_response: fn(TlvItem) -> Result<Resp>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> CommandDescriptor<Req, Resp> {
    pub const fn new(
        cluster: u32,
        command: u32,
        optional: bool,
        no_response: bool,
        encode_request: fn(&Req) -> Result<Vec<u8>>,
        decode_response: fn(TlvItem) -> Result<Resp>,
    ) -> Self {
        Self {
            cluster,
            command,
            optional,
            no_response,
            encode_request,
            decode_response,
            _marker: PhantomData,
        }
    }
}

/// Binds a set of descriptors to one endpoint over an already-built
/// `InteractionClient`. Holds no state of its own beyond the endpoint id.
pub struct ClusterBinding<'a> {
    client: &'a InteractionClient,
    endpoint: u16,
}

impl<'a> ClusterBinding<'a> {
    pub fn new(client: &'a InteractionClient, endpoint: u16) -> Self {
        Self { client, endpoint }
    }

    pub async fn get<T>(&self, attr: &AttributeDescriptor<T>) -> Result<T> {
        let (value, _version) = self.client.get(self.endpoint, attr.cluster, attr.attribute).await?;
        (attr.decode)(&value)
    }

    pub async fn set<T>(&self, attr: &AttributeDescriptor<T>, value: T) -> Result<()> {
        let data = (attr.encode)(value)?;
        self.client.set(self.endpoint, attr.cluster, attr.attribute, data, None).await
    }

    pub async fn subscribe<T>(
        &self,
        attr: &'static AttributeDescriptor<T>,
        min_interval_s: u16,
        max_interval_s: u16,
        listener: impl Fn(T) + Send + Sync + 'static,
    ) -> Result<u32>
    where
        T: Send + 'static,
    {
        let decode = attr.decode;
        let wrapped: Listener = Box::new(move |report| {
            if report.status.is_some() {
                return;
            }
            let value = match datamodel::attribute_value_from_report(report).and_then(|v| decode(&v)) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("cluster facade: dropped an unreadable report: {}", e);
                    return;
                }
            };
            listener(value);
        });
        self.client
            .subscribe(self.endpoint, attr.cluster, attr.attribute, min_interval_s, max_interval_s, Some(wrapped))
            .await
    }

    pub async fn invoke<Req, Resp>(&self, cmd: &CommandDescriptor<Req, Resp>, request: &Req) -> Result<Option<Resp>> {
        let payload = (cmd.encode_request)(request)?;
        let reply = self
            .client
            .invoke(self.endpoint, cmd.cluster, cmd.command, &payload, cmd.no_response, cmd.optional)
            .await?;
        reply.map(cmd.decode_response).transpose()
    }
}

/// On/Off cluster (id 0x0006), the worked example the spec asks for. Further
/// clusters are additional descriptor modules alongside this one, not new code.
pub mod on_off {
    use super::*;

    pub const CLUSTER_ID: u32 = 0x0006;

    const ATTR_ON_OFF_ID: u32 = 0x0000;
    const CMD_OFF_ID: u32 = 0x00;
    const CMD_ON_ID: u32 = 0x01;
    const CMD_TOGGLE_ID: u32 = 0x02;

    fn decode_on_off(value: &AttributeValue) -> Result<bool> {
        datamodel::decode_bool(value)
    }

    fn encode_on_off(value: bool) -> Result<Vec<u8>> {
        datamodel::encode_bool(value)
    }

    pub const ATTR_ON_OFF: AttributeDescriptor<bool> =
        AttributeDescriptor::new(CLUSTER_ID, ATTR_ON_OFF_ID, decode_on_off, encode_on_off);

    fn encode_no_fields(_request: &()) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn decode_no_response(_item: TlvItem) -> Result<()> {
        Ok(())
    }

    pub const CMD_OFF: CommandDescriptor<(), ()> =
        CommandDescriptor::new(CLUSTER_ID, CMD_OFF_ID, true, true, encode_no_fields, decode_no_response);
    pub const CMD_ON: CommandDescriptor<(), ()> =
        CommandDescriptor::new(CLUSTER_ID, CMD_ON_ID, true, true, encode_no_fields, decode_no_response);
    pub const CMD_TOGGLE: CommandDescriptor<(), ()> =
        CommandDescriptor::new(CLUSTER_ID, CMD_TOGGLE_ID, true, true, encode_no_fields, decode_no_response);
}

#[cfg(test)]
mod tests {
    use super::on_off::*;
    use super::*;
    use crate::exchange::{loopback_pair, Exchange, ExchangeProviderImpl};
    use crate::messages::ProtocolMessageHeader;
    use crate::session::Session;
    use crate::subscription::SubscriptionReceiver;
    use crate::tlv::TlvBuffer;
    use std::sync::Arc;

    fn linked_sessions() -> (Session, Session) {
        let key_ab = [11u8; 16];
        let key_ba = [12u8; 16];
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

    fn build_on_off_report(endpoint: u16, value: bool) -> Vec<u8> {
        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct().unwrap();
        tlv.write_array(1).unwrap();
        tlv.write_anon_struct().unwrap();
        tlv.write_struct(1).unwrap();
        tlv.write_uint32(0, 1).unwrap();
        tlv.write_list(1).unwrap();
        tlv.write_uint16(2, endpoint).unwrap();
        tlv.write_uint32(3, CLUSTER_ID).unwrap();
        tlv.write_uint32(4, ATTR_ON_OFF.attribute).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_bool(2, value).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_bool(3, false).unwrap();
        tlv.write_bool(4, false).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.data
    }

    fn build_command_success(endpoint: u16, cluster: u32, command: u32) -> Vec<u8> {
        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct().unwrap();
        tlv.write_array(1).unwrap();
        tlv.write_anon_struct().unwrap();
        tlv.write_struct(1).unwrap(); // CommandStatusIB
        tlv.write_list(0).unwrap();
        tlv.write_uint16(0, endpoint).unwrap();
        tlv.write_uint32(1, cluster).unwrap();
        tlv.write_uint32(2, command).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct(1).unwrap(); // StatusIB
        tlv.write_uint32(0, 0).unwrap(); // Success
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_uint8(0xff, 10).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.data
    }

    #[tokio::test]
    async fn get_decodes_the_on_off_attribute_through_the_descriptor() {
        let (wire_a, wire_b) = loopback_pair();
        let (session_a, session_b) = linked_sessions();
        let provider_a = Arc::new(ExchangeProviderImpl::new(Arc::new(wire_a), session_a));
        let provider_b = ExchangeProviderImpl::new(Arc::new(wire_b), session_b);
        let subscriptions = SubscriptionReceiver::new();
        let client = InteractionClient::new(provider_a, 0, subscriptions);
        let binding = ClusterBinding::new(&client, 1);

        let responder = async {
            let request = provider_b.next_unsolicited().await.expect("read request");
            let exchange_id = request.protocol_header.exchange_id;
            let exchange = provider_b.open_exchange_with_id(exchange_id).await.expect("open exchange");
            let prot = crate::messages::interaction_header(
                ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA,
                exchange_id,
                request.message_header.message_counter as i64,
                true,
            );
            let mut b = prot.encode().expect("encode header");
            b.extend_from_slice(&build_on_off_report(1, true));
            exchange.send(&b).await.expect("send report");
            exchange.recv().await.expect("status ack");
        };

        let (value, _) = tokio::join!(binding.get(&ATTR_ON_OFF), responder);
        assert!(value.expect("get on/off"));
    }

    #[tokio::test]
    async fn invoke_on_returns_unit_on_a_successful_result() {
        let (wire_a, wire_b) = loopback_pair();
        let (session_a, session_b) = linked_sessions();
        let provider_a = Arc::new(ExchangeProviderImpl::new(Arc::new(wire_a), session_a));
        let provider_b = ExchangeProviderImpl::new(Arc::new(wire_b), session_b);
        let subscriptions = SubscriptionReceiver::new();
        let client = InteractionClient::new(provider_a, 0, subscriptions);
        let binding = ClusterBinding::new(&client, 1);

        let responder = async {
            let request = provider_b.next_unsolicited().await.expect("invoke request");
            let exchange_id = request.protocol_header.exchange_id;
            let exchange = provider_b.open_exchange_with_id(exchange_id).await.expect("open exchange");
            let prot = crate::messages::interaction_header(
                ProtocolMessageHeader::INTERACTION_OPCODE_INVOKE_RESP,
                exchange_id,
                request.message_header.message_counter as i64,
                true,
            );
            let mut b = prot.encode().expect("encode header");
            b.extend_from_slice(&build_command_success(1, CLUSTER_ID, CMD_ON.command));
            exchange.send(&b).await.expect("send invoke response");
        };

        let (result, _) = tokio::join!(binding.invoke(&CMD_ON, &()), responder);
        assert_eq!(result.expect("invoke on"), None);
    }
}
