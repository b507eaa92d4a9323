use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::RngCore;
use std::io::{Read, Result, Write};

use crate::tlv::{self, TlvItem, TlvItemValue};

#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub flags: u8,
    pub security_flags: u8,
    pub session_id: u16,
    pub message_counter: u32,
    pub source_node_id: Option<Vec<u8>>,
    pub destination_node_id: Option<Vec<u8>>,
}

impl MessageHeader {
    const FLAG_SRC_PRESENT: u8 = 4;
    const DSIZ_64: u8 = 1;
    const DSIZ_16: u8 = 2;
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags: u8 = 0;
        let src_present = matches!(&self.source_node_id, Some(n) if n.len() == 8);
        if src_present {
            flags |= Self::FLAG_SRC_PRESENT;
        }
        let dst_len = self.destination_node_id.as_ref().map(|n| n.len()).unwrap_or(0);
        if dst_len == 2 {
            flags |= Self::DSIZ_16
        } else if dst_len == 8 {
            flags |= Self::DSIZ_64
        }
        let mut out = Vec::with_capacity(1024);
        out.write_u8(flags)?;
        out.write_u16::<LittleEndian>(self.session_id)?;
        out.write_u8(self.security_flags)?;
        out.write_u32::<LittleEndian>(self.message_counter)?;
        if src_present {
            out.write_all(self.source_node_id.as_ref().unwrap())?;
        }
        if dst_len > 0 {
            out.write_all(self.destination_node_id.as_ref().unwrap())?;
        }
        Ok(out)
    }
    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let flags = cursor.read_u8()?;
        let session_id = cursor.read_u16::<LittleEndian>()?;
        let security_flags = cursor.read_u8()?;
        let message_counter = cursor.read_u32::<LittleEndian>()?;
        let mut source_node_id = None;
        let mut destination_node_id = None;
        if (flags & Self::FLAG_SRC_PRESENT) != 0 {
            let mut v = vec![0; 8];
            cursor.read_exact(v.as_mut())?;
            source_node_id = Some(v);
        };
        if (flags & 3) != 0 {
            let dst_size = match flags & 3 {
                Self::DSIZ_64 => 8,
                Self::DSIZ_16 => 2,
                _ => 0,
            };
            if dst_size > 0 {
                let mut v = vec![0; dst_size];
                cursor.read_exact(v.as_mut())?;
                destination_node_id = Some(v);
            };
        };
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                flags,
                security_flags,
                session_id,
                message_counter,
                source_node_id,
                destination_node_id,
            },
            rest,
        ))
    }
}

#[derive(Debug)]
pub struct ProtocolMessageHeader {
    exchange_flags: u8,
    pub opcode: u8,
    pub exchange_id: u16,
    pub protocol_id: u16,
    pub ack_counter: u32,
}

impl ProtocolMessageHeader {
    pub const FLAG_INITIATOR: u8 = 1;
    pub const FLAG_ACK: u8 = 2;
    pub const FLAG_RELIABILITY: u8 = 4;

    pub const OPCODE_ACK: u8 = 0x10;
    pub const OPCODE_PBKDF_REQ: u8 = 0x20;
    pub const OPCODE_PBKDF_RESP: u8 = 0x21;
    pub const OPCODE_PBKDF_PAKE1: u8 = 0x22;
    pub const OPCODE_PBKDF_PAKE2: u8 = 0x23;
    pub const OPCODE_PBKDF_PAKE3: u8 = 0x24;
    pub const OPCODE_SIGMA1: u8 = 0x30;
    pub const OPCODE_SIGMA2: u8 = 0x31;
    pub const OPCODE_SIGMA3: u8 = 0x32;
    pub const OPCODE_SIGMA2_RESUME: u8 = 0x33;
    pub const OPCODE_STATUS: u8 = 0x40;

    pub const INTERACTION_OPCODE_STATUS_RESPONSE: u8 = 0x1;
    pub const INTERACTION_OPCODE_READ_REQ: u8 = 0x2;
    pub const INTERACTION_OPCODE_SUBSCRIBE_REQ: u8 = 0x3;
    pub const INTERACTION_OPCODE_SUBSCRIBE_RESP: u8 = 0x4;
    pub const INTERACTION_OPCODE_REPORT_DATA: u8 = 0x5;
    pub const INTERACTION_OPCODE_WRITE_REQ: u8 = 0x6;
    pub const INTERACTION_OPCODE_WRITE_RESP: u8 = 0x7;
    pub const INTERACTION_OPCODE_INVOKE_REQ: u8 = 0x8;
    pub const INTERACTION_OPCODE_INVOKE_RESP: u8 = 0x9;
    pub const INTERACTION_OPCODE_TIMED_REQ: u8 = 0xa;

    pub const PROTOCOL_ID_SECURE_CHANNEL: u16 = 0;
    pub const PROTOCOL_ID_INTERACTION: u16 = 1;
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(1024);
        out.write_u8(self.exchange_flags)?;
        out.write_u8(self.opcode)?;
        out.write_u16::<LittleEndian>(self.exchange_id)?;
        out.write_u16::<LittleEndian>(self.protocol_id)?;
        if (self.exchange_flags & Self::FLAG_ACK) != 0 {
            out.write_u32::<LittleEndian>(self.ack_counter)?;
        }
        Ok(out)
    }
    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let exchange_flags = cursor.read_u8()?;
        let opcode = cursor.read_u8()?;
        let exchange_id = cursor.read_u16::<LittleEndian>()?;
        let protocol_id = cursor.read_u16::<LittleEndian>()?;
        let mut ack_counter = 0;
        if (exchange_flags & Self::FLAG_ACK) != 0 {
            ack_counter = cursor.read_u32::<LittleEndian>()?;
        }
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                exchange_flags,
                opcode,
                exchange_id,
                protocol_id,
                ack_counter,
            },
            rest,
        ))
    }
    pub fn is_initiator(&self) -> bool {
        (self.exchange_flags & Self::FLAG_INITIATOR) != 0
    }
    pub fn exchange_flags_ack(&self) -> bool {
        (self.exchange_flags & Self::FLAG_ACK) != 0
    }
    pub fn exchange_flags_reliability(&self) -> bool {
        (self.exchange_flags & Self::FLAG_RELIABILITY) != 0
    }
}

/// Parsed `StatusReport`/interaction status payload (protocol-specific status code).
#[derive(Debug, Clone)]
pub struct StatusReportInfo {
    pub general_code: u16,
    pub protocol_id: u32,
    pub protocol_code: u32,
}

impl StatusReportInfo {
    pub fn is_ok(&self) -> bool {
        self.general_code == 0
    }
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let general_code = cursor.read_u16::<LittleEndian>()?;
        let protocol_id = cursor.read_u32::<LittleEndian>()?;
        let protocol_code = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            general_code,
            protocol_id,
            protocol_code,
        })
    }
}

impl std::fmt::Display for StatusReportInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "general={:#x} protocol={:#x} code={:#x}",
            self.general_code, self.protocol_id, self.protocol_code
        )
    }
}

#[derive(Debug)]
pub struct Message {
    pub message_header: MessageHeader,
    pub protocol_header: ProtocolMessageHeader,
    pub payload: Vec<u8>,
    pub tlv: TlvItem,
    pub status_report_info: Option<StatusReportInfo>,
}

impl Message {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (message_header, rest) = MessageHeader::decode(data)?;
        let (protocol_header, rest) = ProtocolMessageHeader::decode(&rest)?;
        if protocol_header.protocol_id == ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL
            && protocol_header.opcode == ProtocolMessageHeader::OPCODE_STATUS
        {
            let info = StatusReportInfo::decode(&rest).ok();
            return Ok(Self {
                message_header,
                protocol_header,
                payload: rest,
                tlv: TlvItem {
                    tag: 0,
                    value: tlv::TlvItemValue::Invalid(),
                },
                status_report_info: info,
            });
        }
        if rest.is_empty() {
            return Ok(Self {
                message_header,
                protocol_header,
                payload: rest,
                tlv: TlvItem {
                    tag: 0,
                    value: tlv::TlvItemValue::Invalid(),
                },
                status_report_info: None,
            });
        }
        let tlv = tlv::decode_tlv(&rest)?;
        Ok(Self {
            message_header,
            protocol_header,
            payload: rest,
            tlv,
            status_report_info: None,
        })
    }
}

pub(crate) fn secure_channel_header(opcode: u8, exchange: u16, ack: i64, initiator: bool) -> ProtocolMessageHeader {
    let mut flags = ProtocolMessageHeader::FLAG_RELIABILITY;
    if initiator {
        flags |= ProtocolMessageHeader::FLAG_INITIATOR;
    }
    if ack >= 0 {
        flags |= ProtocolMessageHeader::FLAG_ACK;
    }
    ProtocolMessageHeader {
        exchange_flags: flags,
        opcode,
        exchange_id: exchange,
        protocol_id: ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL,
        ack_counter: if ack >= 0 { ack as u32 } else { 0 },
    }
}

pub(crate) fn interaction_header(opcode: u8, exchange: u16, ack: i64, initiator: bool) -> ProtocolMessageHeader {
    let mut flags = ProtocolMessageHeader::FLAG_RELIABILITY;
    if initiator {
        flags |= ProtocolMessageHeader::FLAG_INITIATOR;
    }
    if ack >= 0 {
        flags |= ProtocolMessageHeader::FLAG_ACK;
    }
    ProtocolMessageHeader {
        exchange_flags: flags,
        opcode,
        exchange_id: exchange,
        protocol_id: ProtocolMessageHeader::PROTOCOL_ID_INTERACTION,
        ack_counter: if ack >= 0 { ack as u32 } else { 0 },
    }
}

pub fn ack(exchange: u16, ack_counter: i64) -> Result<Vec<u8>> {
    let prot = secure_channel_header(ProtocolMessageHeader::OPCODE_ACK, exchange, ack_counter, true);
    prot.encode()
}

/// Build a `StatusReport` with general code 0 (success).
pub fn status_report_ok(exchange: u16, ack_counter: i64, protocol_id: u32, protocol_code: u32) -> Result<Vec<u8>> {
    let prot = secure_channel_header(ProtocolMessageHeader::OPCODE_STATUS, exchange, ack_counter, true);
    let mut b = prot.encode()?;
    b.write_u16::<LittleEndian>(0)?;
    b.write_u32::<LittleEndian>(protocol_id)?;
    b.write_u32::<LittleEndian>(protocol_code)?;
    Ok(b)
}

pub fn pbkdf_req(exchange: u16, session_id: u16) -> Result<Vec<u8>> {
    let prot = secure_channel_header(ProtocolMessageHeader::OPCODE_PBKDF_REQ, exchange, -1, true);
    let mut b = prot.encode()?;
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    let mut initiator_random = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut initiator_random);
    tlv.write_octetstring(0x1, &initiator_random)?;
    tlv.write_uint16(2, session_id)?;
    tlv.write_uint8(3, 0)?;
    tlv.write_bool(4, false)?;
    tlv.write_struct_end()?;
    b.write_all(&tlv.data)?;
    Ok(b)
}

pub fn pake1(exchange: u16, key: &[u8], ack_counter: i64) -> Result<Vec<u8>> {
    let prot = secure_channel_header(ProtocolMessageHeader::OPCODE_PBKDF_PAKE1, exchange, ack_counter, true);
    let mut b = prot.encode()?;
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_octetstring(0x1, key)?;
    tlv.write_struct_end()?;
    b.write_all(&tlv.data)?;
    Ok(b)
}

pub fn pake3(exchange: u16, key: &[u8], ack_counter: i64) -> Result<Vec<u8>> {
    let prot = secure_channel_header(ProtocolMessageHeader::OPCODE_PBKDF_PAKE3, exchange, ack_counter, true);
    let mut b = prot.encode()?;
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_octetstring(0x1, key)?;
    tlv.write_struct_end()?;
    b.write_all(&tlv.data)?;
    Ok(b)
}

pub fn sigma1(exchange: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let prot = secure_channel_header(ProtocolMessageHeader::OPCODE_SIGMA1, exchange, -1, true);
    let mut b = prot.encode()?;
    b.write_all(payload)?;
    Ok(b)
}

/// `Sigma2` sent by the responder. `initiator` is false here since the responder did not open the exchange.
pub fn sigma2(exchange: u16, payload: &[u8], ack_counter: i64) -> Result<Vec<u8>> {
    let prot = secure_channel_header(ProtocolMessageHeader::OPCODE_SIGMA2, exchange, ack_counter, false);
    let mut b = prot.encode()?;
    b.write_all(payload)?;
    Ok(b)
}

pub fn sigma2_resume(exchange: u16, payload: &[u8], ack_counter: i64) -> Result<Vec<u8>> {
    let prot = secure_channel_header(ProtocolMessageHeader::OPCODE_SIGMA2_RESUME, exchange, ack_counter, false);
    let mut b = prot.encode()?;
    b.write_all(payload)?;
    Ok(b)
}

pub fn sigma3(exchange: u16, payload: &[u8], ack_counter: i64) -> Result<Vec<u8>> {
    let prot = secure_channel_header(ProtocolMessageHeader::OPCODE_SIGMA3, exchange, ack_counter, true);
    let mut b = prot.encode()?;
    b.write_all(payload)?;
    Ok(b)
}

pub fn im_invoke_request(
    endpoint: u16,
    cluster: u32,
    command: u32,
    exchange_id: u16,
    payload: &[u8],
    timed: bool,
) -> Result<Vec<u8>> {
    let prot = interaction_header(ProtocolMessageHeader::INTERACTION_OPCODE_INVOKE_REQ, exchange_id, -1, true);
    let mut b = prot.encode()?;
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_bool(0x0, false)?;
    tlv.write_bool(0x1, timed)?;
    tlv.write_array(2)?;
    tlv.write_anon_struct()?;
    tlv.write_list(0)?;
    tlv.write_uint16(0, endpoint)?;
    tlv.write_uint32(1, cluster)?;
    tlv.write_uint32(2, command)?;
    tlv.write_struct_end()?;
    tlv.write_struct(1)?;
    tlv.write_raw(payload)?;
    tlv.write_struct_end()?;
    tlv.write_struct_end()?;
    tlv.write_struct_end()?;
    tlv.write_uint8(0xff, 10)?;
    tlv.write_struct_end()?;
    b.write_all(&tlv.data)?;
    Ok(b)
}

/// `TimedRequest`, used immediately before a timed invoke/write per spec 4.E.
pub fn im_timed_request(exchange_id: u16, timeout_ms: u16) -> Result<Vec<u8>> {
    let prot = interaction_header(ProtocolMessageHeader::INTERACTION_OPCODE_TIMED_REQ, exchange_id, -1, true);
    let mut b = prot.encode()?;
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_uint16(0, timeout_ms)?;
    tlv.write_uint8(0xff, 10)?;
    tlv.write_struct_end()?;
    b.write_all(&tlv.data)?;
    Ok(b)
}

pub fn im_read_request(endpoint: u16, cluster: u32, attr: u32) -> Result<Vec<u8>> {
    let prot = interaction_header(ProtocolMessageHeader::INTERACTION_OPCODE_READ_REQ, 0, -1, true);
    let mut b = prot.encode()?;
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_array(0)?;
    tlv.write_anon_list()?;
    tlv.write_uint16(2, endpoint)?;
    tlv.write_uint32(3, cluster)?;
    tlv.write_uint32(4, attr)?;
    tlv.write_struct_end()?;
    tlv.write_struct_end()?;
    tlv.write_bool(3, true)?;
    tlv.write_uint8(0xff, 10)?;
    tlv.write_struct_end()?;
    b.write_all(&tlv.data)?;
    Ok(b)
}

/// Same wire shape as a read request, bundled with `exchange_id` so callers can issue it
/// over an already-open exchange (chunked reassembly, subscriptions) instead of always
/// opening a fresh one.
pub fn im_read_request_ex(endpoint: u16, cluster: u32, attr: u32, exchange_id: u16) -> Result<Vec<u8>> {
    let prot = interaction_header(ProtocolMessageHeader::INTERACTION_OPCODE_READ_REQ, exchange_id, -1, true);
    let mut b = prot.encode()?;
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_array(0)?;
    tlv.write_anon_list()?;
    tlv.write_uint16(2, endpoint)?;
    tlv.write_uint32(3, cluster)?;
    tlv.write_uint32(4, attr)?;
    tlv.write_struct_end()?;
    tlv.write_struct_end()?;
    tlv.write_bool(3, true)?;
    tlv.write_uint8(0xff, 10)?;
    tlv.write_struct_end()?;
    b.write_all(&tlv.data)?;
    Ok(b)
}

/// Single-path convenience wrapper over [im_write_request_multi]. `value_tlv` must
/// already be TLV-encoded with tag 2 (the `Data` field of `AttributeDataIB`).
pub fn im_write_request(
    endpoint: u16,
    cluster: u32,
    attr: u32,
    exchange_id: u16,
    value_tlv: &[u8],
) -> Result<Vec<u8>> {
    let item = WriteItem {
        path: AttributePath::new(endpoint, cluster, attr),
        data_tag2: value_tlv.to_vec(),
        expected_data_version: None,
    };
    im_write_request_multi(&[item], exchange_id, false)
}

/// `(nodeId?, endpointId?, clusterId?, attributeId?)`; `None` fields encode as an
/// absent TLV element (Matter's wildcard). Used both to build outbound requests and
/// to identify the path carried by an inbound `AttributeReportIB`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AttributePath {
    pub node: Option<u64>,
    pub endpoint: Option<u16>,
    pub cluster: Option<u32>,
    pub attribute: Option<u32>,
}

impl AttributePath {
    pub fn new(endpoint: u16, cluster: u32, attribute: u32) -> Self {
        Self {
            node: None,
            endpoint: Some(endpoint),
            cluster: Some(cluster),
            attribute: Some(attribute),
        }
    }

    /// `(*, *, *)`: every attribute of every cluster on every endpoint.
    pub fn wildcard() -> Self {
        Self::default()
    }

    fn write_fields(&self, tlv: &mut tlv::TlvBuffer) -> Result<()> {
        if let Some(node) = self.node {
            tlv.write_uint64(1, node)?;
        }
        if let Some(endpoint) = self.endpoint {
            tlv.write_uint16(2, endpoint)?;
        }
        if let Some(cluster) = self.cluster {
            tlv.write_uint32(3, cluster)?;
        }
        if let Some(attribute) = self.attribute {
            tlv.write_uint32(4, attribute)?;
        }
        Ok(())
    }

    /// Write as a context-tagged `AttributePathIB` field (e.g. `AttributeDataIB.Path`).
    fn write(&self, tlv: &mut tlv::TlvBuffer, tag: u8) -> Result<()> {
        tlv.write_list(tag)?;
        self.write_fields(tlv)?;
        tlv.write_struct_end()
    }

    /// Write as an anonymous array element (one entry of `AttributeRequests`).
    fn write_anon(&self, tlv: &mut tlv::TlvBuffer) -> Result<()> {
        tlv.write_anon_list()?;
        self.write_fields(tlv)?;
        tlv.write_struct_end()
    }

    fn decode(item: &TlvItem) -> Self {
        Self {
            node: item.get_u64(&[1]),
            endpoint: item.get_u16(&[2]),
            cluster: item.get_u32(&[3]),
            attribute: item.get_u32(&[4]),
        }
    }
}

/// Value to write for a single attribute: the attribute path plus its TLV-encoded
/// data (already tagged with tag 2, the `Data` field of `AttributeDataIB`) and an
/// optional expected data version.
pub struct WriteItem {
    pub path: AttributePath,
    pub data_tag2: Vec<u8>,
    pub expected_data_version: Option<u32>,
}

fn im_read_or_subscribe_paths(tlv: &mut tlv::TlvBuffer, tag: u8, paths: &[AttributePath]) -> Result<()> {
    tlv.write_array(tag)?;
    for p in paths {
        p.write_anon(tlv)?;
    }
    tlv.write_struct_end()
}

/// `ReadRequestMessage` for one or more attribute paths (`getAllAttributes`/
/// `getMultipleAttributes`/`get`), sent over an already-open exchange.
pub fn im_read_request_multi(paths: &[AttributePath], exchange_id: u16, fabric_filtered: bool) -> Result<Vec<u8>> {
    let prot = interaction_header(ProtocolMessageHeader::INTERACTION_OPCODE_READ_REQ, exchange_id, -1, true);
    let mut b = prot.encode()?;
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    im_read_or_subscribe_paths(&mut tlv, 0, paths)?;
    tlv.write_bool(3, fabric_filtered)?;
    tlv.write_uint8(0xff, 10)?;
    tlv.write_struct_end()?;
    b.write_all(&tlv.data)?;
    Ok(b)
}

/// `SubscribeRequestMessage` for one or more attribute paths.
pub fn im_subscribe_request_multi(
    paths: &[AttributePath],
    exchange_id: u16,
    min_interval_s: u16,
    max_interval_s: u16,
    keep_subscriptions: bool,
    fabric_filtered: bool,
) -> Result<Vec<u8>> {
    let prot = interaction_header(ProtocolMessageHeader::INTERACTION_OPCODE_SUBSCRIBE_REQ, exchange_id, -1, true);
    let mut b = prot.encode()?;
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_bool(0, keep_subscriptions)?;
    tlv.write_uint16(1, min_interval_s)?;
    tlv.write_uint16(2, max_interval_s)?;
    im_read_or_subscribe_paths(&mut tlv, 3, paths)?;
    tlv.write_bool(7, fabric_filtered)?;
    tlv.write_uint8(0xff, 10)?;
    tlv.write_struct_end()?;
    b.write_all(&tlv.data)?;
    Ok(b)
}

/// `WriteRequestMessage` for one or more attributes. `items[i].data_tag2` must already
/// be TLV-encoded with tag 2 (the `Data` field of `AttributeDataIB`).
pub fn im_write_request_multi(items: &[WriteItem], exchange_id: u16, timed_request: bool) -> Result<Vec<u8>> {
    let prot = interaction_header(ProtocolMessageHeader::INTERACTION_OPCODE_WRITE_REQ, exchange_id, -1, true);
    let mut b = prot.encode()?;
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_bool(0, false)?; // suppressResponse
    tlv.write_bool(1, timed_request)?;
    tlv.write_array(2)?;
    for item in items {
        tlv.write_anon_struct()?;
        if let Some(v) = item.expected_data_version {
            tlv.write_uint32(0, v)?;
        }
        item.path.write(&mut tlv, 1)?;
        tlv.write_raw(&item.data_tag2)?;
        tlv.write_struct_end()?;
    }
    tlv.write_struct_end()?;
    tlv.write_uint8(0xff, 10)?;
    tlv.write_struct_end()?;
    b.write_all(&tlv.data)?;
    Ok(b)
}

/// One decoded `AttributeReportIB`: either attribute data, or a status in place of data.
#[derive(Debug, Clone)]
pub struct AttributeReport {
    pub path: AttributePath,
    pub data: Option<TlvItem>,
    pub data_version: Option<u32>,
    pub status: Option<(u32, Option<u32>)>,
}

/// Decoded `ReportDataMessage` (`DataReport`, opcode 0x5).
#[derive(Debug, Clone, Default)]
pub struct DataReport {
    pub subscription_id: Option<u32>,
    pub reports: Vec<AttributeReport>,
    pub more_chunked_messages: bool,
    pub suppress_response: bool,
}

impl DataReport {
    pub fn decode(tlv: &TlvItem) -> Result<Self> {
        let subscription_id = tlv.get_u32(&[0]);
        let more_chunked_messages = tlv.get_bool(&[3]).unwrap_or(false);
        let suppress_response = tlv.get_bool(&[4]).unwrap_or(false);
        let mut reports = Vec::new();
        if let Some(TlvItemValue::List(items)) = tlv.get(&[1]) {
            for item in items {
                if let Some(TlvItemValue::List(status_fields)) = item.get(&[0]) {
                    let _ = status_fields;
                    let path = item
                        .get_item(&[0, 0])
                        .map(AttributePath::decode)
                        .unwrap_or_default();
                    let code = item.get_u32(&[0, 1, 0]).unwrap_or(1);
                    let cluster_code = item.get_u32(&[0, 1, 1]);
                    reports.push(AttributeReport {
                        path,
                        data: None,
                        data_version: None,
                        status: Some((code, cluster_code)),
                    });
                } else if let Some(path_item) = item.get_item(&[1, 1]) {
                    let path = AttributePath::decode(path_item);
                    let data = item.get_item(&[1, 2]).cloned();
                    let data_version = item.get_u32(&[1, 0]);
                    reports.push(AttributeReport {
                        path,
                        data,
                        data_version,
                        status: None,
                    });
                }
            }
        }
        Ok(Self {
            subscription_id,
            reports,
            more_chunked_messages,
            suppress_response,
        })
    }
}

/// One decoded `AttributeStatusIB` from a `WriteResponseMessage`.
#[derive(Debug, Clone)]
pub struct WriteStatus {
    pub path: AttributePath,
    pub code: u32,
    pub cluster_code: Option<u32>,
}

/// Decoded `WriteResponseMessage` (opcode 0x7).
pub fn decode_write_response(tlv: &TlvItem) -> Vec<WriteStatus> {
    let mut out = Vec::new();
    if let Some(TlvItemValue::List(items)) = tlv.get(&[0]) {
        for item in items {
            let path = item.get_item(&[0, 0]).map(AttributePath::decode).unwrap_or_default();
            let code = item.get_u32(&[0, 1, 0]).unwrap_or(1);
            let cluster_code = item.get_u32(&[0, 1, 1]);
            out.push(WriteStatus {
                path,
                code,
                cluster_code,
            });
        }
    }
    out
}

/// Decoded `SubscribeResponseMessage` (opcode 0x4).
#[derive(Debug, Clone)]
pub struct SubscribeResponseInfo {
    pub subscription_id: u32,
    pub max_interval: u16,
}

pub fn decode_subscribe_response(tlv: &TlvItem) -> Option<SubscribeResponseInfo> {
    Some(SubscribeResponseInfo {
        subscription_id: tlv.get_u32(&[0])?,
        max_interval: tlv.get_u16(&[1])?,
    })
}

/// A command path: `(endpointId, clusterId, commandId)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandPath {
    pub endpoint: u16,
    pub cluster: u32,
    pub command: u32,
}

impl CommandPath {
    fn decode(item: &TlvItem) -> Self {
        Self {
            endpoint: item.get_u16(&[0]).unwrap_or(0),
            cluster: item.get_u32(&[1]).unwrap_or(0),
            command: item.get_u32(&[2]).unwrap_or(0),
        }
    }
}

/// One decoded `InvokeResponseIB`: either a response payload, or a bare result code.
#[derive(Debug, Clone)]
pub enum InvokeResponseItem {
    Response { path: CommandPath, data: TlvItem },
    Result { path: CommandPath, code: u32, cluster_code: Option<u32> },
}

/// Decoded `InvokeResponseMessage` (opcode 0x9). Matter allows more than one entry;
/// this crate's `invoke()` only ever sends a single command and inspects the first.
pub fn decode_invoke_response(tlv: &TlvItem) -> Vec<InvokeResponseItem> {
    let mut out = Vec::new();
    if let Some(TlvItemValue::List(items)) = tlv.get(&[1]) {
        for item in items {
            if let Some(path_item) = item.get_item(&[0, 0]) {
                let path = CommandPath::decode(path_item);
                let data = item.get_item(&[0, 1]).cloned().unwrap_or(TlvItem {
                    tag: 0,
                    value: TlvItemValue::Invalid(),
                });
                out.push(InvokeResponseItem::Response { path, data });
            } else if let Some(path_item) = item.get_item(&[1, 0]) {
                let path = CommandPath::decode(path_item);
                let code = item.get_u32(&[1, 1, 0]).unwrap_or(1);
                let cluster_code = item.get_u32(&[1, 1, 1]);
                out.push(InvokeResponseItem::Result {
                    path,
                    code,
                    cluster_code,
                });
            }
        }
    }
    out
}

pub fn im_subscribe_request(
    endpoint: u16,
    cluster: u32,
    attr: u32,
    exchange_id: u16,
    min_interval_s: u16,
    max_interval_s: u16,
) -> Result<Vec<u8>> {
    let prot = interaction_header(ProtocolMessageHeader::INTERACTION_OPCODE_SUBSCRIBE_REQ, exchange_id, -1, true);
    let mut b = prot.encode()?;
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_bool(0, false)?; // keepSubscriptions
    tlv.write_uint16(1, min_interval_s)?;
    tlv.write_uint16(2, max_interval_s)?;
    tlv.write_array(3)?;
    tlv.write_anon_list()?;
    tlv.write_uint16(2, endpoint)?;
    tlv.write_uint32(3, cluster)?;
    tlv.write_uint32(4, attr)?;
    tlv.write_struct_end()?;
    tlv.write_struct_end()?;
    tlv.write_bool(7, true)?; // isFabricFiltered
    tlv.write_uint8(0xff, 10)?;
    tlv.write_struct_end()?;
    b.write_all(&tlv.data)?;
    Ok(b)
}
