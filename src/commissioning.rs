//! Operational credential provisioning: the commissioner-side half of the
//! CSRRequest -> AddTrustedRootCertificate -> AddNOC -> CommissioningComplete
//! exchange that hands a freshly paired node a fabric identity.
//!
//! Unlike the PASE/CASE handshakes, this flow never touches the wire directly:
//! every step is a single [`InteractionClient::invoke`] against the node's
//! Operational Credentials (0x3e) or General Commissioning (0x30) cluster, run
//! over the session [`crate::controller::MatterController::commission`] already
//! established.

use rand::RngCore;

use crate::cert_matter;
use crate::cert_x509;
use crate::certmanager::CertManager;
use crate::error::{MatterError, Result};
use crate::fabric::Fabric;
use crate::interaction::InteractionClient;
use crate::tlv::{self, TlvBuffer};

const CLUSTER_OPERATIONAL_CREDENTIALS: u32 = 0x3e;
const CMD_CSRREQUEST: u32 = 0x4;
const CMD_ADD_TRUSTED_ROOT_CERTIFICATE: u32 = 0xb;
const CMD_ADDNOC: u32 = 0x6;

const CLUSTER_GENERAL_COMMISSIONING: u32 = 0x30;
const CMD_COMMISSIONING_COMPLETE: u32 = 0x4;

/// Every operational-credential command here targets the root endpoint.
const ENDPOINT_ROOT: u16 = 0;

fn noc_status_to_str(status: u32) -> &'static str {
    match status {
        0 => "Success",
        1 => "InvalidPublicKey",
        2 => "InvalidNodeOpId",
        3 => "InvalidNOC",
        4 => "MissingCsr",
        5 => "TableFull",
        6 => "InvalidAdminSubject",
        9 => "FabricConflict",
        10 => "LabelConflict",
        11 => "InvalidFabricIndex",
        _ => "UnknownStatus",
    }
}

fn map_noc_status_error(context: &'static str, e: MatterError) -> MatterError {
    match e {
        MatterError::InvokeError(code) => MatterError::ProtocolError(format!(
            "{} failed with status {:#x}/{}",
            context,
            code,
            noc_status_to_str(code)
        )),
        other => other,
    }
}

/// `CSRRequest`: ask the node to generate an operational key pair and return its
/// certificate signing request, already ASN.1-decoded and ready for `push_noc`.
async fn send_csr(client: &InteractionClient) -> Result<x509_cert::request::CertReq> {
    let mut nonce = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut request = TlvBuffer::new();
    request.write_octetstring(0, &nonce)?;

    let reply = client
        .invoke(ENDPOINT_ROOT, CLUSTER_OPERATIONAL_CREDENTIALS, CMD_CSRREQUEST, &request.data, false, false)
        .await
        .map_err(|e| map_noc_status_error("CSRRequest", e))?
        .ok_or_else(|| MatterError::ProtocolError("CSRRequest returned no NOCSRElements".to_string()))?;

    let nocsr_elements = reply
        .get_octet_string(&[0])
        .ok_or_else(|| MatterError::ProtocolError("CSRResponse missing NOCSRElements".to_string()))?;
    let nocsr = tlv::decode_tlv(nocsr_elements)?;
    let csr = nocsr
        .get_octet_string(&[1])
        .ok_or_else(|| MatterError::ProtocolError("NOCSRElements missing csr".to_string()))?;
    x509_cert::request::CertReq::try_from(csr)
        .map_err(|e| MatterError::ProtocolError(format!("can't decode csr: {:?}", e)))
}

/// `AddTrustedRootCertificate`: install this fabric's CA certificate (in matter
/// TLV cert form) on the node.
async fn push_trusted_root(client: &InteractionClient, cert_manager: &dyn CertManager) -> Result<()> {
    let ca_pubkey = cert_manager.get_ca_key()?.public_key().to_sec1_bytes();
    let ca_cert = cert_manager.get_ca_cert()?;
    let root_cert = cert_matter::convert_x509_bytes_to_matter(&ca_cert, &ca_pubkey)?;

    let mut request = TlvBuffer::new();
    request.write_octetstring(0, &root_cert)?;

    client
        .invoke(ENDPOINT_ROOT, CLUSTER_OPERATIONAL_CREDENTIALS, CMD_ADD_TRUSTED_ROOT_CERTIFICATE, &request.data, true, false)
        .await
        .map_err(|e| map_noc_status_error("AddTrustedRootCertificate", e))?;
    Ok(())
}

/// `AddNOC`: sign the node's CSR into an operational certificate under this
/// fabric's CA and install it, together with the fabric's identity protection
/// key and the admin subject that will retain CASE access.
async fn push_noc(
    client: &InteractionClient,
    cert_manager: &dyn CertManager,
    csr: x509_cert::request::CertReq,
    node_id: u64,
    controller_id: u64,
    fabric: &Fabric,
) -> Result<()> {
    let node_public_key = csr
        .info
        .public_key
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| MatterError::ProtocolError("csr has no public key bits".to_string()))?;
    let ca_key = cert_manager.get_ca_key()?;
    let ca_pubkey = ca_key.public_key().to_sec1_bytes();
    let noc_x509 = cert_x509::encode_x509(
        node_public_key,
        node_id,
        cert_manager.get_fabric_id(),
        fabric.ca_id,
        &ca_key,
        false,
    )?;
    let noc = cert_matter::convert_x509_bytes_to_matter(&noc_x509, &ca_pubkey)?;

    let mut request = TlvBuffer::new();
    request.write_octetstring(0, &noc)?;
    request.write_octetstring(2, fabric.ipk_epoch_key())?;
    request.write_uint64(3, controller_id)?;
    request.write_uint64(4, 101)?;

    let reply = client
        .invoke(ENDPOINT_ROOT, CLUSTER_OPERATIONAL_CREDENTIALS, CMD_ADDNOC, &request.data, false, false)
        .await
        .map_err(|e| map_noc_status_error("AddNOC", e))?
        .ok_or_else(|| MatterError::ProtocolError("AddNOC returned no NOCResponse".to_string()))?;
    let status = reply.get_int(&[0]).unwrap_or(1) as u32;
    if status != 0 {
        return Err(MatterError::ProtocolError(format!(
            "AddNOC failed with status {}/{}",
            status,
            noc_status_to_str(status)
        )));
    }
    Ok(())
}

/// `CommissioningComplete`: tell the node its fail-safe window is done and the
/// new fabric membership should be made permanent.
async fn commissioning_complete(client: &InteractionClient) -> Result<()> {
    let reply = client
        .invoke(ENDPOINT_ROOT, CLUSTER_GENERAL_COMMISSIONING, CMD_COMMISSIONING_COMPLETE, &[], false, false)
        .await?
        .ok_or_else(|| MatterError::ProtocolError("CommissioningComplete returned no response".to_string()))?;
    let error_code = reply.get_int(&[0]).unwrap_or(1);
    if error_code != 0 {
        return Err(MatterError::ProtocolError(format!(
            "CommissioningComplete failed with error code {}",
            error_code
        )));
    }
    Ok(())
}

/// Run the full operational-credential provisioning sequence over an
/// already-established session's interaction client: CSRRequest,
/// AddTrustedRootCertificate, AddNOC, CommissioningComplete, in that order,
/// aborting on the first failure.
pub async fn provision_operational_credentials(
    client: &InteractionClient,
    cert_manager: &dyn CertManager,
    fabric: &Fabric,
    node_id: u64,
    controller_id: u64,
) -> Result<()> {
    let csr = send_csr(client).await?;
    push_trusted_root(client, cert_manager).await?;
    push_noc(client, cert_manager, csr, node_id, controller_id, fabric).await?;
    commissioning_complete(client).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{loopback_pair, Exchange, ExchangeProviderImpl};
    use crate::messages::ProtocolMessageHeader;
    use crate::session::Session;
    use crate::subscription::SubscriptionReceiver;
    use std::sync::Arc;

    fn linked_sessions() -> (Session, Session) {
        let key_ab = [21u8; 16];
        let key_ba = [22u8; 16];
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

    fn make_client() -> (InteractionClient, ExchangeProviderImpl) {
        let (wire_a, wire_b) = loopback_pair();
        let (session_a, session_b) = linked_sessions();
        let provider_a = Arc::new(ExchangeProviderImpl::new(Arc::new(wire_a), session_a));
        let provider_b = ExchangeProviderImpl::new(Arc::new(wire_b), session_b);
        let client = InteractionClient::new(provider_a, 0, SubscriptionReceiver::new());
        (client, provider_b)
    }

    fn build_invoke_result(endpoint: u16, cluster: u32, command: u32, code: u32) -> Vec<u8> {
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
        tlv.write_uint32(0, code).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_uint8(0xff, 10).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.data
    }

    fn build_invoke_response_data(endpoint: u16, cluster: u32, command: u32, fields: impl Fn(&mut TlvBuffer)) -> Vec<u8> {
        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct().unwrap();
        tlv.write_array(1).unwrap();
        tlv.write_anon_struct().unwrap();
        tlv.write_struct(0).unwrap(); // CommandDataIB
        tlv.write_list(0).unwrap();
        tlv.write_uint16(0, endpoint).unwrap();
        tlv.write_uint32(1, cluster).unwrap();
        tlv.write_uint32(2, command).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct(1).unwrap(); // Fields
        fields(&mut tlv);
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_uint8(0xff, 10).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.data
    }

    struct FixedCertManager {
        ca_key: p256::SecretKey,
        fabric_id: u64,
    }

    impl FixedCertManager {
        fn new(fabric_id: u64) -> Self {
            Self {
                ca_key: p256::SecretKey::random(&mut rand::thread_rng()),
                fabric_id,
            }
        }
    }

    impl CertManager for FixedCertManager {
        fn get_ca_cert(&self) -> anyhow::Result<Vec<u8>> {
            cert_x509::encode_x509(&self.ca_key.public_key().to_sec1_bytes(), 1, self.fabric_id, 1, &self.ca_key, true)
        }
        fn get_ca_key(&self) -> anyhow::Result<p256::SecretKey> {
            Ok(self.ca_key.clone())
        }
        fn get_ca_public_key(&self) -> anyhow::Result<Vec<u8>> {
            Ok(self.ca_key.public_key().to_sec1_bytes().to_vec())
        }
        fn get_user_cert(&self, id: u64) -> anyhow::Result<Vec<u8>> {
            cert_x509::encode_x509(&self.ca_key.public_key().to_sec1_bytes(), id, self.fabric_id, 1, &self.ca_key, false)
        }
        fn get_user_key(&self, _id: u64) -> anyhow::Result<p256::SecretKey> {
            Ok(self.ca_key.clone())
        }
        fn get_fabric_id(&self) -> u64 {
            self.fabric_id
        }
    }

    async fn reply_once(provider_b: &ExchangeProviderImpl, payload: Vec<u8>) {
        let request = provider_b.next_unsolicited().await.expect("read request");
        let exchange_id = request.protocol_header.exchange_id;
        let exchange = provider_b.open_exchange_with_id(exchange_id).await.expect("open exchange");
        let prot = crate::messages::interaction_header(
            ProtocolMessageHeader::INTERACTION_OPCODE_INVOKE_RESP,
            exchange_id,
            request.message_header.message_counter as i64,
            true,
        );
        let mut b = prot.encode().expect("encode header");
        b.extend_from_slice(&payload);
        exchange.send(&b).await.expect("send invoke response");
    }

    #[test]
    fn noc_status_to_str_knows_the_documented_codes() {
        assert_eq!(noc_status_to_str(0), "Success");
        assert_eq!(noc_status_to_str(3), "InvalidNOC");
        assert_eq!(noc_status_to_str(200), "UnknownStatus");
    }

    #[tokio::test]
    async fn send_csr_propagates_a_csrrequest_failure() {
        let (client, provider_b) = make_client();
        let responder = reply_once(
            &provider_b,
            build_invoke_result(0, CLUSTER_OPERATIONAL_CREDENTIALS, CMD_CSRREQUEST, 4),
        );

        let (result, _) = tokio::join!(send_csr(&client), responder);
        let err = result.expect_err("CSRRequest should fail");
        assert!(err.to_string().contains("MissingCsr"));
    }

    #[tokio::test]
    async fn push_trusted_root_succeeds_on_a_success_result() {
        let (client, provider_b) = make_client();
        let cm = FixedCertManager::new(0xface);
        let responder = reply_once(
            &provider_b,
            build_invoke_result(0, CLUSTER_OPERATIONAL_CREDENTIALS, CMD_ADD_TRUSTED_ROOT_CERTIFICATE, 0),
        );

        let (result, _) = tokio::join!(push_trusted_root(&client, &cm), responder);
        result.expect("push_trusted_root should succeed");
    }

    #[tokio::test]
    async fn push_trusted_root_surfaces_the_noc_status_on_failure() {
        let (client, provider_b) = make_client();
        let cm = FixedCertManager::new(0xface);
        let responder = reply_once(
            &provider_b,
            build_invoke_result(0, CLUSTER_OPERATIONAL_CREDENTIALS, CMD_ADD_TRUSTED_ROOT_CERTIFICATE, 9),
        );

        let (result, _) = tokio::join!(push_trusted_root(&client, &cm), responder);
        let err = result.expect_err("AddTrustedRootCertificate should fail");
        assert!(err.to_string().contains("FabricConflict"));
    }

    #[tokio::test]
    async fn commissioning_complete_surfaces_a_nonzero_error_code() {
        let (client, provider_b) = make_client();
        let responder = reply_once(
            &provider_b,
            build_invoke_response_data(0, CLUSTER_GENERAL_COMMISSIONING, CMD_COMMISSIONING_COMPLETE, |tlv| {
                tlv.write_uint8(0, 1).unwrap();
            }),
        );

        let (result, _) = tokio::join!(commissioning_complete(&client), responder);
        let err = result.expect_err("CommissioningComplete should fail");
        assert!(err.to_string().contains("error code 1"));
    }

    #[tokio::test]
    async fn commissioning_complete_succeeds_on_error_code_zero() {
        let (client, provider_b) = make_client();
        let responder = reply_once(
            &provider_b,
            build_invoke_response_data(0, CLUSTER_GENERAL_COMMISSIONING, CMD_COMMISSIONING_COMPLETE, |tlv| {
                tlv.write_uint8(0, 0).unwrap();
            }),
        );

        let (result, _) = tokio::join!(commissioning_complete(&client), responder);
        result.expect("CommissioningComplete should succeed");
    }
}
