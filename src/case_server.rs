//! CASE server (spec 4.C): accepts an inbound sigma1 on an already-open [Exchange]
//! and drives sigma1 -> (sigma2-resume | sigma2/sigma3) -> session, ported from the
//! teacher's initiator-only `sigma.rs` math onto the responder side, which the
//! teacher codebase never implemented (there was no accessory role to serve).

use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use rand::RngCore;

use crate::error::{MatterError, Result};
use crate::exchange::Exchange;
use crate::fabric::FabricLocator;
use crate::messages::{self, ProtocolMessageHeader};
use crate::messenger::{Messenger, RawMessage};
use crate::resumption::{ResumptionRecord, ResumptionStore};
use crate::session::Session;
use crate::sigma;

fn status_report_failure(exchange: u16) -> std::io::Result<Vec<u8>> {
    let prot = messages::secure_channel_header(ProtocolMessageHeader::OPCODE_STATUS, exchange, -1, false);
    let mut b = prot.encode()?;
    b.write_u16::<LittleEndian>(1)?; // general code 1: Failure
    b.write_u32::<LittleEndian>(ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL as u32)?;
    b.write_u32::<LittleEndian>(0)?;
    Ok(b)
}

fn random_resumption_id() -> Vec<u8> {
    let mut id = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Accept a CASE handshake. `sigma1_message` is the already-decoded inbound sigma1
/// (typically an `ExchangeProvider::next_unsolicited()` result turned into a
/// `RawMessage` for the exchange the caller then opened with `sigma1_message`'s id).
pub async fn accept_case(
    exchange: Arc<dyn Exchange>,
    sigma1_message: RawMessage,
    fabrics: Arc<dyn FabricLocator>,
    resumption: Arc<dyn ResumptionStore>,
) -> Result<Session> {
    let exchange_id = exchange.id();
    let messenger = Messenger::new(exchange);

    if sigma1_message.protocol_id != ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL
        || sigma1_message.opcode != ProtocolMessageHeader::OPCODE_SIGMA1
    {
        return Err(MatterError::ProtocolMismatch {
            expected: ProtocolMessageHeader::OPCODE_SIGMA1,
            got: sigma1_message.opcode,
        });
    }

    let result = run(&messenger, exchange_id, &sigma1_message, &fabrics, &resumption).await;
    if result.is_err() {
        if let Ok(status) = status_report_failure(exchange_id) {
            let _ = messenger.send(&status).await;
        }
        log::warn!("CASE handshake abandoned on exchange {}: {:?}", exchange_id, result.as_ref().err());
    }
    result
}

async fn run(
    messenger: &Messenger,
    exchange_id: u16,
    sigma1_message: &RawMessage,
    fabrics: &Arc<dyn FabricLocator>,
    resumption: &Arc<dyn ResumptionStore>,
) -> Result<Session> {
    let fields = sigma::parse_sigma1(&sigma1_message.payload)
        .map_err(|e| MatterError::HandshakeFailure(e.to_string()))?;

    let resume_attempt = match (&fields.resumption_id, &fields.initiator_resume_mic) {
        (Some(rid), Some(mic)) => resumption
            .find_resumption_record_by_id(rid)
            .map(|record| (record, mic.clone())),
        _ => None,
    };

    match resume_attempt {
        Some((record, mic)) => run_resume(messenger, exchange_id, sigma1_message, &fields, record, &mic, fabrics, resumption).await,
        None => run_full(messenger, exchange_id, sigma1_message, &fields, fabrics, resumption).await,
    }
}

async fn run_resume(
    messenger: &Messenger,
    exchange_id: u16,
    sigma1_message: &RawMessage,
    fields: &sigma::Sigma1Fields,
    record: ResumptionRecord,
    initiator_mic: &[u8],
    fabrics: &Arc<dyn FabricLocator>,
    resumption: &Arc<dyn ResumptionStore>,
) -> Result<Session> {
    let resumption_id_peer = fields
        .resumption_id
        .as_ref()
        .expect("resume_attempt only set when resumption_id is present");

    sigma::verify_initiator_resume_mic(&record.shared_secret, &fields.initiator_random, resumption_id_peer, initiator_mic)
        .map_err(|e| MatterError::HandshakeFailure(format!("resume MIC verification failed: {}", e)))?;

    let fabric = fabrics
        .fabric_by_index(record.fabric_index)
        .ok_or_else(|| MatterError::HandshakeFailure("resumption record references an unknown fabric".to_string()))?;

    let new_resumption_id = random_resumption_id();
    let responder_mic = sigma::compute_responder_resume_mic(&record.shared_secret, &fields.initiator_random, &new_resumption_id)
        .map_err(|e| MatterError::Crypto(e.to_string()))?;

    let local_session_id: u16 = rand::random();
    let sigma2_resume_payload = sigma::sigma2_resume_payload(local_session_id, &new_resumption_id, &responder_mic)
        .map_err(|e| MatterError::Crypto(e.to_string()))?;

    let sigma2_resume_message = messages::sigma2_resume(
        exchange_id,
        &sigma2_resume_payload,
        sigma1_message.message_counter as i64,
    )
    .map_err(|e| MatterError::ProtocolError(e.to_string()))?;
    messenger.send(&sigma2_resume_message).await?;
    // spec 4.C resume step 7: waitForSuccess() — require an actual ok StatusReport,
    // not just the absence of an error one, before treating the resume as confirmed.
    messenger.wait_for_success().await?;

    let session_keys = sigma::derive_resumed_session_keys(
        &record.shared_secret,
        &fabric.signed_ipk().map_err(|e| MatterError::Crypto(e.to_string()))?,
        &sigma1_message.payload,
        &sigma2_resume_payload,
    )
    .map_err(|e| MatterError::Crypto(e.to_string()))?;

    resumption.remove_resumption_record(resumption_id_peer);
    resumption.save_resumption_record(ResumptionRecord {
        resumption_id: new_resumption_id,
        shared_secret: record.shared_secret.clone(),
        fabric_index: record.fabric_index,
        peer_node_id: record.peer_node_id,
    });

    // spec 4.C resume step 4: salt = random_peer ‖ resumptionId_peer
    let mut salt = fields.initiator_random.clone();
    salt.extend_from_slice(resumption_id_peer);

    let mut session = Session::new();
    session.set_encrypt_key(&session_keys[..16]);
    session.set_decrypt_key(&session_keys[16..32]);
    session.session_id = fields.initiator_session_id;
    session.my_session_id = local_session_id;
    session.local_node = Some(fabric.node_id.to_le_bytes().to_vec());
    session.remote_node = Some(record.peer_node_id.to_le_bytes().to_vec());
    session.fabric_index = Some(record.fabric_index);
    session.initiator = false;
    session.resumable = true;
    session.salt = salt;
    log::debug!("CASE resume complete on exchange {}, session_id={}", exchange_id, session.session_id);
    Ok(session)
}

async fn run_full(
    messenger: &Messenger,
    exchange_id: u16,
    sigma1_message: &RawMessage,
    fields: &sigma::Sigma1Fields,
    fabrics: &Arc<dyn FabricLocator>,
    resumption: &Arc<dyn ResumptionStore>,
) -> Result<Session> {
    let fabric = fabrics
        .find_fabric_from_destination_id(&fields.destination_id, &fields.initiator_random)
        .ok_or_else(|| MatterError::HandshakeFailure("no fabric matches sigma1 destinationId".to_string()))?;

    let mut ctx = sigma::ResponderSigmaContext::new(sigma1_message.payload.clone(), fields.initiator_eph_public_key.clone());
    let new_resumption_id = random_resumption_id();
    sigma::sigma2_full(&fabric, &mut ctx, &new_resumption_id).map_err(|e| MatterError::HandshakeFailure(e.to_string()))?;

    let sigma2_message = messages::sigma2(exchange_id, &ctx.sigma2_payload, sigma1_message.message_counter as i64)
        .map_err(|e| MatterError::ProtocolError(e.to_string()))?;
    let sigma3_raw = messenger.request(&sigma2_message).await?;
    if sigma3_raw.protocol_id != ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL
        || sigma3_raw.opcode != ProtocolMessageHeader::OPCODE_SIGMA3
    {
        return Err(MatterError::ProtocolMismatch {
            expected: ProtocolMessageHeader::OPCODE_SIGMA3,
            got: sigma3_raw.opcode,
        });
    }

    let identity = sigma::verify_sigma3(&fabric, &ctx, &sigma3_raw.payload).map_err(|e| MatterError::HandshakeFailure(e.to_string()))?;
    let session_keys =
        sigma::derive_session_keys(&fabric, &ctx, &sigma3_raw.payload).map_err(|e| MatterError::Crypto(e.to_string()))?;
    // spec.md:106: sessionSalt = IPK ‖ hash(sigma1Bytes ‖ sigma2Bytes ‖ sigma3Bytes)
    let session_salt =
        sigma::full_session_salt(&fabric, &ctx, &sigma3_raw.payload).map_err(|e| MatterError::Crypto(e.to_string()))?;

    messenger
        .send_status(ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL as u32, 0)
        .await?;

    resumption.save_resumption_record(ResumptionRecord {
        resumption_id: new_resumption_id,
        shared_secret: ctx.shared.as_ref().expect("sigma2_full sets shared").raw_secret_bytes().to_vec(),
        fabric_index: fabric.index,
        peer_node_id: identity.node_id,
    });

    let mut session = Session::new();
    session.set_encrypt_key(&session_keys[..16]);
    session.set_decrypt_key(&session_keys[16..32]);
    session.session_id = fields.initiator_session_id;
    session.my_session_id = ctx.session_id;
    session.local_node = Some(fabric.node_id.to_le_bytes().to_vec());
    session.remote_node = Some(identity.node_id.to_le_bytes().to_vec());
    session.fabric_index = Some(fabric.index);
    session.initiator = false;
    session.resumable = false;
    session.salt = session_salt;
    log::debug!("CASE full handshake complete on exchange {}, session_id={}", exchange_id, session.session_id);
    Ok(session)
}
