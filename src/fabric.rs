//! Fabric membership: per-fabric key material and credential verification.
//!
//! A `Fabric` wraps a device's own operational identity (NOC + key, via [CertManager])
//! in one fabric together with that fabric's identity protection key, and supplies
//! the crypto operations CASE (sigma1 destination id, sigma2/sigma3 signing, NOC chain
//! verification) needs on both initiator and responder sides.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

use crate::{cert_matter, certmanager::CertManager, util::cryptoutil};

/// Default identity protection key epoch, matching the teacher's fixed test fabric.
/// A production commissioner instead provisions this value per fabric during
/// AddNOC (spec 4.F "commissioning" supplement); callers that have one can set it
/// with [Fabric::with_ipk_epoch_key].
const DEFAULT_IPK_EPOCH_KEY: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0xa, 0xb, 0xc, 0xd, 0xe, 0xf];

pub struct Fabric {
    pub id: u64,
    pub ca_id: u64,
    pub node_id: u64,
    /// Position of this fabric in its owning `FabricTable`, carried on resumption
    /// records and sessions so a later lookup doesn't need the destination id again.
    pub index: u8,
    ca_public_key: Vec<u8>,
    ipk_epoch_key: Vec<u8>,
    cert_manager: Arc<dyn CertManager>,
}

/// Result of a successful [Fabric::verify_credentials] call.
pub struct VerifiedIdentity {
    pub node_id: u64,
    pub public_key: Vec<u8>,
}

impl Fabric {
    pub fn new(node_id: u64, cert_manager: Arc<dyn CertManager>) -> Result<Self> {
        let ca_public_key = cert_manager.get_ca_public_key()?;
        Ok(Self {
            id: cert_manager.get_fabric_id(),
            ca_id: 1,
            node_id,
            index: 0,
            ca_public_key,
            ipk_epoch_key: DEFAULT_IPK_EPOCH_KEY.to_vec(),
            cert_manager,
        })
    }

    pub fn with_ipk_epoch_key(mut self, key: Vec<u8>) -> Self {
        self.ipk_epoch_key = key;
        self
    }

    pub fn with_index(mut self, index: u8) -> Self {
        self.index = index;
        self
    }

    pub fn ca_public_key(&self) -> &[u8] {
        &self.ca_public_key
    }

    /// Identity protection key epoch handed to a freshly commissioned node in
    /// AddNOC (spec 4.F "commissioning" supplement).
    pub fn ipk_epoch_key(&self) -> &[u8] {
        &self.ipk_epoch_key
    }

    /// CompressedFabricId per 4.10.1.2: HKDF-SHA256(ca root public key, fabric id, "CompressedFabric").
    pub fn compressed(&self) -> Result<Vec<u8>> {
        let mut buf_id = Vec::new();
        buf_id.write_u64::<BigEndian>(self.id)?;
        cryptoutil::hkdf_sha256(&buf_id, &self.ca_public_key[1..], "CompressedFabric".as_bytes(), 8)
    }

    /// Identity Protection Key for this fabric, used to salt sigma1 destination ids
    /// and the sigma2/sigma3 AEAD nonces.
    pub fn signed_ipk(&self) -> Result<Vec<u8>> {
        cryptoutil::hkdf_sha256(
            &self.compressed()?,
            &self.ipk_epoch_key,
            "GroupKey v1.0".as_bytes(),
            16,
        )
    }

    /// Sign `tbs` with this fabric's operational private key (sigma3's signed data, or
    /// the responder's half of sigma2).
    pub fn sign(&self, tbs: &[u8]) -> Result<Vec<u8>> {
        let key = self.cert_manager.get_user_key(self.node_id)?;
        let key = ecdsa::SigningKey::from(key);
        let sig = key.sign_recoverable(tbs)?.0;
        Ok(sig.to_bytes().to_vec())
    }

    /// This node's own operational certificate in matter tlv wire format, as sent in
    /// sigma2/sigma3's TBE payload.
    pub fn node_matter_cert(&self) -> Result<Vec<u8>> {
        let x509 = self.cert_manager.get_user_cert(self.node_id)?;
        cert_matter::convert_x509_bytes_to_matter(&x509, &self.ca_public_key)
    }

    /// Verify a peer-presented operational certificate (and optional intermediate CA
    /// certificate) against this fabric's trust root, returning the verified peer
    /// identity on success. This is the named "certificate chain verifier" collaborator
    /// from spec 4.C, concretely backed by the single-CA-per-fabric PKI model the rest
    /// of this crate already assumes (see DESIGN.md).
    pub fn verify_credentials(
        &self,
        node_op_cert: &[u8],
        intermediate_ca_cert: Option<&[u8]>,
    ) -> Result<VerifiedIdentity> {
        let issuer_public_key = match intermediate_ca_cert {
            Some(ica) => {
                let decoded_ica = cert_matter::decode_matter_cert(ica)?;
                cert_matter::verify_matter_cert_signature(&decoded_ica, &self.ca_public_key)
                    .context("intermediate CA certificate does not chain to fabric root")?;
                decoded_ica.public_key
            }
            None => self.ca_public_key.clone(),
        };
        let noc = cert_matter::decode_matter_cert(node_op_cert)?;
        cert_matter::verify_matter_cert_signature(&noc, &issuer_public_key)
            .context("operational certificate signature verification failed")?;
        let node_id = noc
            .node_id
            .context("operational certificate missing subject node id")?;
        let fabric_id = noc
            .fabric_id
            .context("operational certificate missing subject fabric id")?;
        if fabric_id != self.id {
            return Err(anyhow::anyhow!(
                "operational certificate fabric id {:#x} does not match fabric {:#x}",
                fabric_id,
                self.id
            ));
        }
        Ok(VerifiedIdentity {
            node_id,
            public_key: noc.public_key,
        })
    }

    /// Destination id for this fabric/own-node-id pair, as used both by the initiator
    /// (who knows the responder's node id up front) to build sigma1, and by the
    /// responder (trying each of its own fabrics) to recognise which one a sigma1 was
    /// addressed to.
    pub fn destination_id(&self, initiator_random: &[u8]) -> Result<Vec<u8>> {
        let mut dst = Vec::new();
        dst.write_all(initiator_random)?;
        dst.write_all(&self.ca_public_key)?;
        dst.write_u64::<LittleEndian>(self.id)?;
        dst.write_u64::<LittleEndian>(self.node_id)?;
        cryptoutil::hmac_sha256(&dst, &self.signed_ipk()?)
    }
}

/// External collaborator: resolves the fabric (and own operational identity within it)
/// that a sigma1 `destinationId` was computed against, so the CASE responder knows
/// which credentials to answer with. Named in spec 4.C as "the fabric table".
pub trait FabricLocator: Send + Sync {
    fn find_fabric_from_destination_id(
        &self,
        destination_id: &[u8],
        initiator_random: &[u8],
    ) -> Option<Arc<Fabric>>;
    fn fabric_by_index(&self, index: u8) -> Option<Arc<Fabric>>;
}

/// In-memory fabric table sufficient for a controller or single-device process managing
/// a small, static set of fabrics.
pub struct FabricTable {
    fabrics: Vec<Arc<Fabric>>,
}

impl FabricTable {
    pub fn new(fabrics: Vec<Arc<Fabric>>) -> Self {
        Self { fabrics }
    }
}

impl FabricLocator for FabricTable {
    fn find_fabric_from_destination_id(
        &self,
        destination_id: &[u8],
        initiator_random: &[u8],
    ) -> Option<Arc<Fabric>> {
        self.fabrics
            .iter()
            .find(|f| match f.destination_id(initiator_random) {
                Ok(d) => d.as_slice() == destination_id,
                Err(_) => false,
            })
            .cloned()
    }

    fn fabric_by_index(&self, index: u8) -> Option<Arc<Fabric>> {
        self.fabrics.get(index as usize).cloned()
    }
}
