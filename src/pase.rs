//! PASE client: SPAKE2+ initiator handshake over an already-open [Exchange]
//! (spec 4.B). Ported from the teacher's `controller::auth_spake`, rewritten
//! against [Messenger] instead of a bespoke retransmit context, and fixed to
//! actually check the peer's key-confirmation value (`hBX`) instead of
//! discarding it.

use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{MatterError, Result};
use crate::exchange::Exchange;
use crate::messages::{self, ProtocolMessageHeader};
use crate::messenger::Messenger;
use crate::session::Session;
use crate::spake2p;

const SPAKE_CONTEXT_SEED: &str = "CHIP PAKE V1 Commissioning";

fn pin_to_passcode(pin: u32) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(pin)
        .map_err(|e| MatterError::ProtocolError(e.to_string()))?;
    Ok(out)
}

/// Run the full PASE handshake on `exchange` against `pin`, returning a `Session`
/// ready to encrypt/decrypt the resulting secure unicast connection.
///
/// Closes its Messenger (releasing the exchange) on every exit path, including error.
pub async fn run_pase(exchange: Arc<dyn Exchange>, pin: u32) -> Result<Session> {
    let exchange_id = exchange.id();
    let messenger = Messenger::new(exchange);

    let local_session_id: u16 = rand::random();

    log::debug!("pase: sending PbkdfParamRequest on exchange {}", exchange_id);
    let pbkdf_req_message = messages::pbkdf_req(exchange_id, local_session_id)
        .map_err(|e| MatterError::ProtocolError(e.to_string()))?;
    let pbkdf_response = messenger.request(&pbkdf_req_message).await?;
    if pbkdf_response.protocol_id != ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL
        || pbkdf_response.opcode != ProtocolMessageHeader::OPCODE_PBKDF_RESP
    {
        return Err(MatterError::ProtocolMismatch {
            expected: ProtocolMessageHeader::OPCODE_PBKDF_RESP,
            got: pbkdf_response.opcode,
        });
    }

    let iterations = pbkdf_response
        .tlv
        .get_int(&[4, 1])
        .ok_or_else(|| MatterError::ProtocolError("missing PbkdfParameters (iterations)".to_string()))?;
    let salt = pbkdf_response
        .tlv
        .get_octet_string(&[4, 2])
        .ok_or_else(|| MatterError::ProtocolError("missing PbkdfParameters (salt)".to_string()))?;
    let peer_session_id = pbkdf_response
        .tlv
        .get_u16(&[3])
        .ok_or_else(|| MatterError::ProtocolError("pbkdf response missing session id".to_string()))?;

    let engine = spake2p::Engine::new().map_err(|e| MatterError::Crypto(e.to_string()))?;
    let mut ctx = engine
        .start(&pin_to_passcode(pin)?, salt, iterations as u32)
        .map_err(|e| MatterError::Crypto(e.to_string()))?;

    log::debug!("pase: sending Pake1");
    let pake1_message = messages::pake1(exchange_id, ctx.x.as_bytes(), -1)
        .map_err(|e| MatterError::ProtocolError(e.to_string()))?;
    let pake2 = messenger.request(&pake1_message).await?;
    if pake2.protocol_id != ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL
        || pake2.opcode != ProtocolMessageHeader::OPCODE_PBKDF_PAKE2
    {
        return Err(MatterError::ProtocolMismatch {
            expected: ProtocolMessageHeader::OPCODE_PBKDF_PAKE2,
            got: pake2.opcode,
        });
    }
    let pake2_pb = pake2
        .tlv
        .get_octet_string(&[1])
        .ok_or_else(|| MatterError::ProtocolError("pake2 missing pB".to_string()))?;
    let peer_verifier = pake2
        .tlv
        .get_octet_string(&[2])
        .ok_or_else(|| MatterError::ProtocolError("pake2 missing cB".to_string()))?
        .to_vec();
    ctx.y = p256::EncodedPoint::from_bytes(pake2_pb)
        .map_err(|e| MatterError::Crypto(e.to_string()))?;

    let mut hash_seed = SPAKE_CONTEXT_SEED.as_bytes().to_vec();
    hash_seed.extend_from_slice(&pbkdf_req_message[6..]);
    hash_seed.extend_from_slice(&pbkdf_response.payload);
    engine
        .finish(&mut ctx, &hash_seed)
        .map_err(|e| MatterError::Crypto(e.to_string()))?;

    let our_cb = ctx
        .cb
        .as_ref()
        .ok_or_else(|| MatterError::Crypto("spake2p did not compute cB".to_string()))?;
    if our_cb != &peer_verifier {
        return Err(MatterError::KeyConfirmationFailure);
    }

    log::debug!("pase: sending Pake3");
    let our_ca = ctx
        .ca
        .as_ref()
        .ok_or_else(|| MatterError::Crypto("spake2p did not compute cA".to_string()))?;
    let pake3_message = messages::pake3(exchange_id, our_ca, -1)
        .map_err(|e| MatterError::ProtocolError(e.to_string()))?;
    messenger.send(&pake3_message).await?;
    // spec 4.B step 8: waitForSuccess() — the reply must actually be a StatusReport
    // with an ok code, not just "whatever came back wasn't an error StatusReport".
    messenger.wait_for_success().await?;

    let mut session = Session::new();
    session.set_encrypt_key(
        ctx.encrypt_key
            .as_ref()
            .ok_or_else(|| MatterError::Crypto("spake2p did not derive encrypt key".to_string()))?,
    );
    session.set_decrypt_key(
        ctx.decrypt_key
            .as_ref()
            .ok_or_else(|| MatterError::Crypto("spake2p did not derive decrypt key".to_string()))?,
    );
    session.session_id = peer_session_id;
    session.my_session_id = local_session_id;
    session.initiator = true;
    session.resumable = false;
    log::debug!("pase: handshake complete, session_id={}", session.session_id);
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{loopback_pair, ExchangeProvider, ExchangeProviderImpl};
    use crate::tlv::TlvBuffer;

    fn unencrypted_provider(wire: crate::exchange::LoopbackWire) -> ExchangeProviderImpl {
        ExchangeProviderImpl::new(Arc::new(wire), Session::new())
    }

    /// Emulates just enough of the accessory side of a PASE handshake to drive the
    /// initiator through PbkdfParamResponse/Pake1/Pake2, then answers with a Pake2
    /// whose key-confirmation tag does not match anything the initiator computed.
    async fn respond_with_bad_pake2(provider: &ExchangeProviderImpl) {
        let request = provider.next_unsolicited().await.expect("pbkdf req");
        let exchange_id = request.protocol_header.exchange_id;
        let exchange = provider
            .open_exchange_with_id(exchange_id)
            .await
            .expect("open exchange");

        let iterations: u32 = 1000;
        let salt: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];
        let session_id: u16 = 55;

        let mut resp_tlv = TlvBuffer::new();
        resp_tlv.write_anon_struct().unwrap();
        resp_tlv.write_uint16(3, session_id).unwrap();
        resp_tlv.write_struct(4).unwrap();
        resp_tlv.write_uint32(1, iterations).unwrap();
        resp_tlv.write_octetstring(2, &salt).unwrap();
        resp_tlv.write_struct_end().unwrap();
        resp_tlv.write_struct_end().unwrap();

        // Built by hand rather than via messages::pbkdf_req, since that builder is
        // initiator-only; the shape (ProtocolMessageHeader + TLV) is the same.
        let resp_bytes = {
            let mut b = Vec::new();
            b.push(ProtocolMessageHeader::FLAG_RELIABILITY | ProtocolMessageHeader::FLAG_ACK);
            b.push(ProtocolMessageHeader::OPCODE_PBKDF_RESP);
            b.extend_from_slice(&exchange_id.to_le_bytes());
            b.extend_from_slice(&ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL.to_le_bytes());
            b.extend_from_slice(&request.message_header.message_counter.to_le_bytes());
            b.extend_from_slice(&resp_tlv.data);
            b
        };
        exchange.send(&resp_bytes).await.expect("send pbkdf resp");

        let pake1 = exchange.recv().await.expect("pake1");
        let peer_pa = pake1.tlv.get_octet_string(&[1]).expect("pake1 pA").to_vec();

        let mut pake2_tlv = TlvBuffer::new();
        pake2_tlv.write_anon_struct().unwrap();
        pake2_tlv.write_octetstring(1, &peer_pa).unwrap(); // pB: any valid point, unchecked by pase.rs
        pake2_tlv.write_octetstring(2, &[0u8; 32]).unwrap(); // cB: deliberately wrong verifier
        pake2_tlv.write_struct_end().unwrap();

        let pake2_bytes = {
            let mut b = Vec::new();
            b.push(ProtocolMessageHeader::FLAG_RELIABILITY | ProtocolMessageHeader::FLAG_ACK);
            b.push(ProtocolMessageHeader::OPCODE_PBKDF_PAKE2);
            b.extend_from_slice(&exchange_id.to_le_bytes());
            b.extend_from_slice(&ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL.to_le_bytes());
            b.extend_from_slice(&pake1.message_header.message_counter.to_le_bytes());
            b.extend_from_slice(&pake2_tlv.data);
            b
        };
        exchange.send(&pake2_bytes).await.expect("send pake2");
    }

    #[tokio::test]
    async fn verifier_mismatch_fails_with_key_confirmation_failure() {
        let (wire_a, wire_b) = loopback_pair();
        let provider_a = unencrypted_provider(wire_a);
        let provider_b = unencrypted_provider(wire_b);

        let exchange = provider_a.open_exchange().await.expect("open exchange");

        let client = run_pase(exchange, 20202021);
        let responder = respond_with_bad_pake2(&provider_b);

        let (client_result, _) = tokio::join!(client, responder);
        assert!(matches!(
            client_result,
            Err(MatterError::KeyConfirmationFailure)
        ));
    }
}
