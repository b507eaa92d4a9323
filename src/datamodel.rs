//! Attribute value decoding shared by the interaction client and cluster facade
//! (spec 4.E/4.F, resolved open question in SPEC_FULL.md §9: legitimately absent
//! data is `Null`, not an error).

use crate::error::{MatterError, Result};
use crate::messages::AttributeReport;
use crate::tlv::{TlvBuffer, TlvItem, TlvItemValue};

/// A decoded `AttributeDataIB.Data`: either present TLV, or Matter's explicit null.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    Present(TlvItem),
    Null,
}

/// Turn one decoded `AttributeReport` into its value, rejecting the genuinely
/// missing case (neither `data` nor `status` set) as a protocol error. A report
/// carrying a `status` instead of data is the caller's responsibility to check
/// first; this function assumes `report.status` is `None`.
pub fn attribute_value_from_report(report: &AttributeReport) -> Result<AttributeValue> {
    match &report.data {
        Some(item) if matches!(item.value, TlvItemValue::Nil()) => Ok(AttributeValue::Null),
        Some(item) => Ok(AttributeValue::Present(item.clone())),
        None => Err(MatterError::ProtocolError(
            "attribute report carried neither data nor status".to_string(),
        )),
    }
}

pub fn decode_bool(value: &AttributeValue) -> Result<bool> {
    match value {
        AttributeValue::Present(item) => match item.value {
            TlvItemValue::Bool(b) => Ok(b),
            _ => Err(MatterError::ProtocolError(
                "attribute value is not a boolean".to_string(),
            )),
        },
        AttributeValue::Null => Err(MatterError::ProtocolError(
            "attribute value is null, expected a boolean".to_string(),
        )),
    }
}

/// `Data` (tag 2) of a `WriteItem`/command field for a plain boolean value.
pub fn encode_bool(value: bool) -> Result<Vec<u8>> {
    let mut tlv = TlvBuffer::new();
    tlv.write_bool(2, value)
        .map_err(|e| MatterError::Tlv(e.to_string()))?;
    Ok(tlv.data)
}

pub fn decode_u8(value: &AttributeValue) -> Result<u8> {
    match value {
        AttributeValue::Present(item) => match item.value {
            TlvItemValue::Int(v) => Ok(v as u8),
            _ => Err(MatterError::ProtocolError(
                "attribute value is not an integer".to_string(),
            )),
        },
        AttributeValue::Null => Err(MatterError::ProtocolError(
            "attribute value is null, expected an integer".to_string(),
        )),
    }
}

pub fn encode_u8(tag: u8, value: u8) -> Result<Vec<u8>> {
    let mut tlv = TlvBuffer::new();
    tlv.write_uint8(tag, value)
        .map_err(|e| MatterError::Tlv(e.to_string()))?;
    Ok(tlv.data)
}
