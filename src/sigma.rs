use std::io::Write;

use crate::{fabric, tlv, util::cryptoutil};
use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use ccm::{aead::Aead, KeyInit};

pub struct SigmaContext {
    pub sigma1_payload: Vec<u8>,
    pub sigma2_payload: Vec<u8>,
    pub sigma3_payload: Vec<u8>,
    pub session_id: u16,
    eph_key: p256::ecdh::EphemeralSecret,
    pub node_id: u64,
    pub responder_public: Vec<u8>,
    pub responder_session: u16,
    pub shared: Option<p256::ecdh::SharedSecret>,
}

impl SigmaContext {
    pub fn new(node_id: u64) -> Self {
        Self {
            sigma1_payload: Vec::new(),
            sigma2_payload: Vec::new(),
            sigma3_payload: Vec::new(),
            session_id: rand::random(),
            eph_key: p256::ecdh::EphemeralSecret::random(&mut rand::thread_rng()),
            node_id,
            responder_public: Vec::new(),
            responder_session: 0,
            shared: None,
        }
    }
}

pub fn sigma1(fabric: &fabric::Fabric, ctx: &mut SigmaContext, ca_pubkey: &[u8]) -> Result<()> {
    let mut initator_random = [0; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut initator_random);

    // send sigma1
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_octetstring(1, &initator_random)?;

    tlv.write_uint16(2, ctx.session_id)?;
    let mut dst = Vec::new();
    dst.write_all(&initator_random)?;
    dst.write_all(ca_pubkey)?;
    dst.write_u64::<LittleEndian>(fabric.id)?;
    dst.write_u64::<LittleEndian>(ctx.node_id)?;

    let dst_id = cryptoutil::hmac_sha256(&dst, &fabric.signed_ipk()?)?;
    tlv.write_octetstring(3, &dst_id)?;
    tlv.write_octetstring(4, &ctx.eph_key.public_key().to_sec1_bytes())?;
    tlv.write_struct_end()?;
    ctx.sigma1_payload = tlv.data.clone();
    Ok(())
}

type Aes128Ccm = ccm::Ccm<aes::Aes128, ccm::consts::U16, ccm::consts::U13>;

pub fn sigma3(
    fabric: &fabric::Fabric,
    ctx: &mut SigmaContext,
    ctrl_private_key: &[u8],
    ctrl_matter_cert: &[u8],
) -> Result<()> {
    let ctrl_key = p256::SecretKey::from_sec1_der(ctrl_private_key)?;
    let ctrl_key = ecdsa::SigningKey::from(ctrl_key);

    let tbs = {
        let mut tlv = tlv::TlvBuffer::new();
        tlv.write_anon_struct()?;
        tlv.write_octetstring(1, ctrl_matter_cert)?;
        tlv.write_octetstring(3, &ctx.eph_key.public_key().to_sec1_bytes())?;
        tlv.write_octetstring(4, &ctx.responder_public)?;
        tlv.write_struct_end()?;
        let sig = ctrl_key.sign_recoverable(&tlv.data)?.0;
        sig.to_bytes()
    };
    let mut tlv_tbe = tlv::TlvBuffer::new();
    tlv_tbe.write_anon_struct()?;
    tlv_tbe.write_octetstring(1, ctrl_matter_cert)?;
    tlv_tbe.write_octetstring(3, &tbs)?;
    tlv_tbe.write_struct_end()?;

    let responder_public_key = p256::PublicKey::from_sec1_bytes(&ctx.responder_public)?;
    let shared = ctx.eph_key.diffie_hellman(&responder_public_key);
    let mut th = ctx.sigma1_payload.clone();
    th.extend_from_slice(&ctx.sigma2_payload);
    let transscript_hash = cryptoutil::sha256(&th);
    let mut s3_salt = fabric.signed_ipk()?;
    s3_salt.extend_from_slice(&transscript_hash);
    let s3k = cryptoutil::hkdf_sha256(
        &s3_salt,
        shared.raw_secret_bytes().as_slice(),
        "Sigma3".as_bytes(),
        16,
    )?;

    let aes_key = aes::cipher::crypto_common::Key::<Aes128Ccm>::from_slice(&s3k);
    let cipher = Aes128Ccm::new(aes_key);
    let encrypted = match cipher.encrypt(
        "NCASE_Sigma3N".as_bytes().into(),
        ccm::aead::Payload {
            msg: &tlv_tbe.data,
            aad: &[],
        },
    ) {
        Ok(e) => e,
        Err(e) => return Err(anyhow::anyhow!(format!("encrypt failed {:?}", e))),
    };
    let mut tlv_s3 = tlv::TlvBuffer::new();
    tlv_s3.write_anon_struct()?;
    tlv_s3.write_octetstring(1, &encrypted)?;
    tlv_s3.write_struct_end()?;
    ctx.sigma3_payload = tlv_s3.data;
    ctx.shared = Some(shared);

    Ok(())
}

// ---------------------------------------------------------------------------
// Responder (CASE server) side. The initiator functions above build sigma1/sigma3
// from the dialling controller's point of view; the functions below build sigma2
// (full and resume variants) and consume sigma3, from the accessory's point of view.
// Same crypto primitives (ECDH over P-256, HKDF/HMAC-SHA256, AES-128-CCM, ECDSA),
// applied with initiator/responder roles swapped.
// ---------------------------------------------------------------------------

/// Sigma1 fields relevant to the responder, parsed out of the raw tlv payload.
pub struct Sigma1Fields {
    pub initiator_random: Vec<u8>,
    pub initiator_session_id: u16,
    pub destination_id: Vec<u8>,
    pub initiator_eph_public_key: Vec<u8>,
    pub resumption_id: Option<Vec<u8>>,
    pub initiator_resume_mic: Option<Vec<u8>>,
}

pub fn parse_sigma1(payload: &[u8]) -> Result<Sigma1Fields> {
    let tlv = tlv::decode_tlv(payload)?;
    Ok(Sigma1Fields {
        initiator_random: tlv
            .get_octet_string_owned(&[1])
            .ok_or_else(|| anyhow::anyhow!("sigma1 missing initiatorRandom"))?,
        initiator_session_id: tlv
            .get_u16(&[2])
            .ok_or_else(|| anyhow::anyhow!("sigma1 missing initiatorSessionId"))?,
        destination_id: tlv
            .get_octet_string_owned(&[3])
            .ok_or_else(|| anyhow::anyhow!("sigma1 missing destinationId"))?,
        initiator_eph_public_key: tlv
            .get_octet_string_owned(&[4])
            .ok_or_else(|| anyhow::anyhow!("sigma1 missing initiatorEphPublicKey"))?,
        resumption_id: tlv.get_octet_string_owned(&[6]),
        initiator_resume_mic: tlv.get_octet_string_owned(&[7]),
    })
}

/// State the responder accumulates across sigma1/sigma2/sigma3.
pub struct ResponderSigmaContext {
    pub session_id: u16,
    eph_key: p256::ecdh::EphemeralSecret,
    pub initiator_public: Vec<u8>,
    pub sigma1_payload: Vec<u8>,
    pub sigma2_payload: Vec<u8>,
    pub shared: Option<p256::ecdh::SharedSecret>,
}

impl ResponderSigmaContext {
    pub fn new(sigma1_payload: Vec<u8>, initiator_public: Vec<u8>) -> Self {
        Self {
            session_id: rand::random(),
            eph_key: p256::ecdh::EphemeralSecret::random(&mut rand::thread_rng()),
            initiator_public,
            sigma1_payload,
            sigma2_payload: Vec::new(),
            shared: None,
        }
    }
}

const SIGMA2_NONCE: &[u8] = "NCASE_Sigma2N".as_bytes();

/// Build the full (non-resume) sigma2 response: sign {responderNOC, responderEph,
/// initiatorEph} with this fabric's operational key, wrap it with the NOC into a TBE2
/// struct, encrypt under Sigma2Key, and lay out the wire payload.
pub fn sigma2_full(
    fabric: &fabric::Fabric,
    ctx: &mut ResponderSigmaContext,
    resumption_id: &[u8],
) -> Result<()> {
    let initiator_public_key = p256::PublicKey::from_sec1_bytes(&ctx.initiator_public)?;
    let shared = ctx.eph_key.diffie_hellman(&initiator_public_key);

    let responder_noc = fabric.node_matter_cert()?;
    let responder_eph_public = ctx.eph_key.public_key().to_sec1_bytes();

    let tbs = {
        let mut tlv = tlv::TlvBuffer::new();
        tlv.write_anon_struct()?;
        tlv.write_octetstring(1, &responder_noc)?;
        tlv.write_octetstring(3, &responder_eph_public)?;
        tlv.write_octetstring(4, &ctx.initiator_public)?;
        tlv.write_struct_end()?;
        tlv.data
    };
    let signature = fabric.sign(&tbs)?;

    let mut tlv_tbe = tlv::TlvBuffer::new();
    tlv_tbe.write_anon_struct()?;
    tlv_tbe.write_octetstring(1, &responder_noc)?;
    tlv_tbe.write_octetstring(3, &signature)?;
    tlv_tbe.write_octetstring(4, resumption_id)?;
    tlv_tbe.write_struct_end()?;

    let mut responder_random = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut responder_random);

    // sigma2Salt = IPK ‖ random_local ‖ ecdhPublicKey_local ‖ hash(sigma1Bytes)
    let mut salt = fabric.signed_ipk()?;
    salt.extend_from_slice(&responder_random);
    salt.extend_from_slice(&responder_eph_public);
    salt.extend_from_slice(&cryptoutil::sha256(&ctx.sigma1_payload));
    let s2k = cryptoutil::hkdf_sha256(&salt, shared.raw_secret_bytes().as_slice(), "Sigma2".as_bytes(), 16)?;

    let aes_key = aes::cipher::crypto_common::Key::<Aes128Ccm>::from_slice(&s2k);
    let cipher = Aes128Ccm::new(aes_key);
    let encrypted = match cipher.encrypt(SIGMA2_NONCE.into(), ccm::aead::Payload { msg: &tlv_tbe.data, aad: &[] }) {
        Ok(e) => e,
        Err(e) => return Err(anyhow::anyhow!(format!("sigma2 encrypt failed {:?}", e))),
    };

    let mut tlv2 = tlv::TlvBuffer::new();
    tlv2.write_anon_struct()?;
    tlv2.write_octetstring(1, &responder_random)?;
    tlv2.write_uint16(2, ctx.session_id)?;
    tlv2.write_octetstring(3, &responder_eph_public)?;
    tlv2.write_octetstring(4, &encrypted)?;
    tlv2.write_struct_end()?;

    ctx.sigma2_payload = tlv2.data;
    ctx.shared = Some(shared);
    Ok(())
}

/// Consume an initiator's sigma3, decrypting and verifying its signed NOC against
/// `fabric`'s trust root. Returns the verified peer node id on success.
pub fn verify_sigma3(
    fabric: &fabric::Fabric,
    ctx: &ResponderSigmaContext,
    sigma3_payload: &[u8],
) -> Result<crate::fabric::VerifiedIdentity> {
    let tlv = tlv::decode_tlv(sigma3_payload)?;
    let encrypted = tlv
        .get_octet_string(&[1])
        .ok_or_else(|| anyhow::anyhow!("sigma3 missing encrypted payload"))?;

    let shared = ctx.shared.as_ref().context("sigma2 not yet computed")?;
    let mut th = ctx.sigma1_payload.clone();
    th.extend_from_slice(&ctx.sigma2_payload);
    let mut salt = fabric.signed_ipk()?;
    salt.extend_from_slice(&cryptoutil::sha256(&th));
    let s3k = cryptoutil::hkdf_sha256(&salt, shared.raw_secret_bytes().as_slice(), "Sigma3".as_bytes(), 16)?;

    let aes_key = aes::cipher::crypto_common::Key::<Aes128Ccm>::from_slice(&s3k);
    let cipher = Aes128Ccm::new(aes_key);
    let decrypted = match cipher.decrypt("NCASE_Sigma3N".as_bytes().into(), ccm::aead::Payload { msg: encrypted, aad: &[] }) {
        Ok(d) => d,
        Err(e) => return Err(anyhow::anyhow!(format!("sigma3 decrypt failed {:?}", e))),
    };

    let tbe3 = tlv::decode_tlv(&decrypted)?;
    let initiator_noc = tbe3
        .get_octet_string(&[1])
        .ok_or_else(|| anyhow::anyhow!("sigma3 TBE missing initiatorNOC"))?;
    let initiator_signature = tbe3
        .get_octet_string(&[3])
        .ok_or_else(|| anyhow::anyhow!("sigma3 TBE missing signature"))?;

    let responder_eph_public = tlv::decode_tlv(&ctx.sigma2_payload)?
        .get_octet_string_owned(&[3])
        .context("sigma2 payload missing responder eph public key")?;

    let tbs = {
        let mut tlv = tlv::TlvBuffer::new();
        tlv.write_anon_struct()?;
        tlv.write_octetstring(1, initiator_noc)?;
        tlv.write_octetstring(3, &ctx.initiator_public)?;
        tlv.write_octetstring(4, &responder_eph_public)?;
        tlv.write_struct_end()?;
        tlv.data
    };

    let identity = fabric.verify_credentials(initiator_noc, None)?;
    use ecdsa::signature::Verifier;
    let verifying_key = ecdsa::VerifyingKey::<p256::NistP256>::from_sec1_bytes(&identity.public_key)?;
    let signature = ecdsa::Signature::<p256::NistP256>::try_from(initiator_signature)?;
    verifying_key
        .verify(&tbs, &signature)
        .map_err(|_| anyhow::anyhow!("sigma3 signature verification failed"))?;

    Ok(identity)
}

/// `sessionSalt = IPK ‖ hash(sigma1Bytes ‖ sigma2Bytes ‖ sigma3Bytes)` (spec.md:106),
/// the full-handshake session descriptor's salt field and the HKDF salt for
/// [derive_session_keys].
pub fn full_session_salt(fabric: &fabric::Fabric, ctx: &ResponderSigmaContext, sigma3_payload: &[u8]) -> Result<Vec<u8>> {
    let mut transcript = ctx.sigma1_payload.clone();
    transcript.extend_from_slice(&ctx.sigma2_payload);
    transcript.extend_from_slice(sigma3_payload);
    let transcript_hash = cryptoutil::sha256(&transcript);
    let mut salt = fabric.signed_ipk()?;
    salt.extend_from_slice(&transcript_hash);
    Ok(salt)
}

/// Session encrypt/decrypt keys (32 bytes: `[..16]` responder-to-initiator,
/// `[16..32]` initiator-to-responder) derived once sigma1..sigma3 are complete.
pub fn derive_session_keys(fabric: &fabric::Fabric, ctx: &ResponderSigmaContext, sigma3_payload: &[u8]) -> Result<Vec<u8>> {
    let shared = ctx.shared.as_ref().context("shared secret not established")?;
    let salt = full_session_salt(fabric, ctx, sigma3_payload)?;
    cryptoutil::hkdf_sha256(&salt, shared.raw_secret_bytes().as_slice(), "SessionKeys".as_bytes(), 16 * 3)
}

const RESUME1_NONCE: &[u8] = "NCASE_SigmaR1".as_bytes();
const RESUME2_NONCE: &[u8] = "NCASE_SigmaR2".as_bytes();

fn resume_mic_key(shared_secret: &[u8], initiator_random: &[u8], resumption_id: &[u8], info: &str) -> Result<Vec<u8>> {
    let mut salt = initiator_random.to_vec();
    salt.extend_from_slice(resumption_id);
    cryptoutil::hkdf_sha256(&salt, shared_secret, info.as_bytes(), 16)
}

/// Authentication tag proving possession of a prior session's shared secret, attached
/// to sigma1 by an initiator attempting resumption.
pub fn compute_initiator_resume_mic(shared_secret: &[u8], initiator_random: &[u8], resumption_id: &[u8]) -> Result<Vec<u8>> {
    let key = resume_mic_key(shared_secret, initiator_random, resumption_id, "SigmaR1")?;
    let aes_key = aes::cipher::crypto_common::Key::<Aes128Ccm>::from_slice(&key);
    let cipher = Aes128Ccm::new(aes_key);
    cipher
        .encrypt(RESUME1_NONCE.into(), ccm::aead::Payload { msg: &[], aad: resumption_id })
        .map_err(|e| anyhow::anyhow!(format!("resume mic encrypt failed {:?}", e)))
}

/// Verify an initiator's resume MIC against a stored resumption record's shared secret.
/// Per this crate's CASE-resume design (DESIGN.md), a decrypt failure here is treated
/// as fatal: there is no fallback to a full handshake for that sigma1.
pub fn verify_initiator_resume_mic(shared_secret: &[u8], initiator_random: &[u8], resumption_id: &[u8], mic: &[u8]) -> Result<()> {
    let key = resume_mic_key(shared_secret, initiator_random, resumption_id, "SigmaR1")?;
    let aes_key = aes::cipher::crypto_common::Key::<Aes128Ccm>::from_slice(&key);
    let cipher = Aes128Ccm::new(aes_key);
    cipher
        .decrypt(RESUME1_NONCE.into(), ccm::aead::Payload { msg: mic, aad: resumption_id })
        .map_err(|_| anyhow::anyhow!("initiator resume MIC verification failed"))?;
    Ok(())
}

/// Responder's counterpart MIC, returned in sigma2Resume so the initiator can
/// authenticate the responder too.
pub fn compute_responder_resume_mic(shared_secret: &[u8], initiator_random: &[u8], resumption_id: &[u8]) -> Result<Vec<u8>> {
    let key = resume_mic_key(shared_secret, initiator_random, resumption_id, "SigmaR2")?;
    let aes_key = aes::cipher::crypto_common::Key::<Aes128Ccm>::from_slice(&key);
    let cipher = Aes128Ccm::new(aes_key);
    cipher
        .encrypt(RESUME2_NONCE.into(), ccm::aead::Payload { msg: &[], aad: resumption_id })
        .map_err(|e| anyhow::anyhow!(format!("resume mic encrypt failed {:?}", e)))
}

/// Build a sigma2Resume payload: new resumption id, responder session id and the
/// responder's resume MIC, once the initiator's resume MIC has already verified.
pub fn sigma2_resume_payload(
    session_id: u16,
    new_resumption_id: &[u8],
    responder_mic: &[u8],
) -> Result<Vec<u8>> {
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_octetstring(1, new_resumption_id)?;
    tlv.write_octetstring(2, responder_mic)?;
    tlv.write_uint16(3, session_id)?;
    tlv.write_struct_end()?;
    Ok(tlv.data)
}

/// Session keys for a resumed session: same HKDF shape as [derive_session_keys] but
/// over the (cheaper) sigma1/sigma2Resume transcript and the reused shared secret.
pub fn derive_resumed_session_keys(
    shared_secret: &[u8],
    fabric_ipk: &[u8],
    sigma1_payload: &[u8],
    sigma2_resume_payload: &[u8],
) -> Result<Vec<u8>> {
    let mut transcript = sigma1_payload.to_vec();
    transcript.extend_from_slice(sigma2_resume_payload);
    let transcript_hash = cryptoutil::sha256(&transcript);
    let mut salt = fabric_ipk.to_vec();
    salt.extend_from_slice(&transcript_hash);
    cryptoutil::hkdf_sha256(&salt, shared_secret, "SessionKeys".as_bytes(), 16 * 3)
}
