//! MatterController (spec 4.B/4.C external interface): the top-level object a
//! commissioner process owns. It ties the fabric table, resumption store, and
//! shared subscription receiver to the PASE client and CASE server, and hands
//! out an `InteractionClient` for every session it establishes.
//!
//! Superseded: the teacher's `controller::Controller`/`Connection` (a bespoke
//! `retransmit::RetrContext`-based initiator for both PASE and CASE over a raw
//! `active_connection::ActiveConnection`). This crate only plays the CASE
//! *responder* role (see SPEC_FULL.md §1 Non-goals), so the old CASE-initiator
//! `auth_sigma` has no counterpart here; PASE-initiator and CASE-responder both
//! now run on the shared `exchange`/`messenger` stack instead of their own
//! retransmit loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::certmanager::CertManager;
use crate::error::{MatterError, Result};
use crate::exchange::{Exchange, ExchangeProvider, ExchangeProviderImpl, Wire};
use crate::fabric::{Fabric, FabricLocator, FabricTable};
use crate::interaction::InteractionClient;
use crate::messages::ProtocolMessageHeader;
use crate::messenger::RawMessage;
use crate::pase;
use crate::resumption::{InMemoryResumptionStore, ResumptionRecord, ResumptionStore};
use crate::session::Session;
use crate::subscription::SubscriptionReceiver;

/// A session established (as PASE initiator or CASE responder) and registered with
/// a `MatterController`. Owns the `ExchangeProvider` backing it and hands out
/// `InteractionClient`s, all sharing the controller's `SubscriptionReceiver` so a
/// subscription outlives any one client handle (SPEC_FULL.md §9).
pub struct ControllerSession {
    session_id: u16,
    peer_node_id: Option<u64>,
    fabric_index: Option<u8>,
    provider: Arc<ExchangeProviderImpl>,
    subscriptions: Arc<SubscriptionReceiver>,
}

impl ControllerSession {
    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    pub fn peer_node_id(&self) -> Option<u64> {
        self.peer_node_id
    }

    pub fn fabric_index(&self) -> Option<u8> {
        self.fabric_index
    }

    /// Build an `InteractionClient` bound to this session. Cheap: callers may hold
    /// several at once, each with its own read cache, sharing the one subscription
    /// receiver.
    pub fn interaction_client(&self) -> InteractionClient {
        InteractionClient::new(self.provider.clone(), self.session_id, self.subscriptions.clone())
    }
}

/// Top-level controller state: this node's own fabric membership(s), the fabric
/// table a CASE responder consults, the resumption store, and the registry of
/// live sessions. One controller is shared across every commissioned/reconnected
/// device the process talks to.
pub struct MatterController {
    fabric: Arc<Fabric>,
    fabrics: Arc<FabricTable>,
    resumption: Arc<dyn ResumptionStore>,
    subscriptions: Arc<SubscriptionReceiver>,
    sessions: Mutex<HashMap<u16, Arc<ControllerSession>>>,
}

impl MatterController {
    /// Build a controller whose own operational identity on `node_id` is backed by
    /// `cert_manager` (see `certmanager::FileCertManager` for the default, file-based
    /// implementation). `additional_fabrics` lets a multi-fabric controller also
    /// recognise sigma1s addressed to fabrics it administers but isn't itself a
    /// member of; the common single-fabric case passes an empty vec.
    pub fn new(
        cert_manager: Arc<dyn CertManager>,
        node_id: u64,
        additional_fabrics: Vec<Arc<Fabric>>,
    ) -> anyhow::Result<Arc<Self>> {
        let fabric = Arc::new(Fabric::new(node_id, cert_manager)?);
        let mut table = vec![fabric.clone()];
        table.extend(additional_fabrics);
        Ok(Arc::new(Self {
            fabric,
            fabrics: Arc::new(FabricTable::new(table)),
            resumption: Arc::new(InMemoryResumptionStore::new()),
            subscriptions: SubscriptionReceiver::new(),
            sessions: Mutex::new(HashMap::new()),
        }))
    }

    /// This controller's own fabric membership, used by the `commissioning` module
    /// to sign a device's operational certificate during `AddNOC`.
    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionReceiver> {
        &self.subscriptions
    }

    /// Registry key for a freshly established session, not yet handed to any peer.
    /// Collisions against already-registered sessions are vanishingly unlikely (a
    /// random u16 against at most a handful of concurrent sessions) but are checked
    /// and retried rather than risking two sessions sharing a registry slot.
    pub fn get_next_available_session_id(&self) -> u16 {
        let sessions = self.sessions.lock().expect("session registry lock poisoned");
        loop {
            let candidate: u16 = rand::random();
            if !sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn session(&self, session_id: u16) -> Option<Arc<ControllerSession>> {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .get(&session_id)
            .cloned()
    }

    fn register(
        &self,
        peer_node_id: Option<u64>,
        fabric_index: Option<u8>,
        provider: ExchangeProviderImpl,
    ) -> Arc<ControllerSession> {
        let session_id = self.get_next_available_session_id();
        let entry = Arc::new(ControllerSession {
            session_id,
            peer_node_id,
            fabric_index,
            provider: Arc::new(provider),
            subscriptions: self.subscriptions.clone(),
        });
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .insert(session_id, entry.clone());
        entry
    }

    /// Run the PASE initiator handshake (spec 4.B) over `wire` against `pin`, then
    /// re-home the connection onto a freshly encrypted `ExchangeProvider` and
    /// register the result. `wire` must not already be driving another
    /// `ExchangeProviderImpl`'s read loop; the unencrypted provider used for the
    /// handshake itself is dropped (and its read loop cancelled) before the
    /// encrypted one takes over.
    pub async fn commission(&self, wire: Arc<dyn Wire>, pin: u32) -> Result<Arc<ControllerSession>> {
        let handshake_provider = ExchangeProviderImpl::new(wire.clone(), Session::new());
        let exchange = handshake_provider.open_exchange().await?;
        let session = pase::run_pase(exchange, pin).await?;
        drop(handshake_provider);

        let peer_node_id = session.peer_node_id();
        let fabric_index = session.fabric_index;
        let provider = ExchangeProviderImpl::new(wire, session);
        Ok(self.register(peer_node_id, fabric_index, provider))
    }

    /// Accept one inbound CASE handshake (spec 4.C) over `wire`: wait for the next
    /// unsolicited message, which must be a sigma1, and drive it through
    /// `case_server::accept_case` using this controller's fabric table and
    /// resumption store. Intended to be called in a loop (see `serve_case`) by
    /// whatever owns the listening transport.
    pub async fn accept_case_once(&self, wire: Arc<dyn Wire>) -> Result<Arc<ControllerSession>> {
        let handshake_provider = Arc::new(ExchangeProviderImpl::new(wire.clone(), Session::new()));
        let message = handshake_provider
            .next_unsolicited()
            .await
            .ok_or_else(|| MatterError::TransportError("wire closed before sigma1 arrived".to_string()))?;
        if message.protocol_header.protocol_id != ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL
            || message.protocol_header.opcode != ProtocolMessageHeader::OPCODE_SIGMA1
        {
            return Err(MatterError::ProtocolMismatch {
                expected: ProtocolMessageHeader::OPCODE_SIGMA1,
                got: message.protocol_header.opcode,
            });
        }
        let exchange_id = message.protocol_header.exchange_id;
        let exchange: Arc<dyn Exchange> = handshake_provider.open_exchange_with_id(exchange_id).await?;
        let sigma1_message: RawMessage = message.into();

        let session =
            crate::case_server::accept_case(exchange, sigma1_message, self.fabrics.clone(), self.resumption.clone()).await?;
        drop(handshake_provider);

        let peer_node_id = session.peer_node_id();
        let fabric_index = session.fabric_index;
        let provider = ExchangeProviderImpl::new(wire, session);
        Ok(self.register(peer_node_id, fabric_index, provider))
    }

    /// Background CASE responder loop: repeatedly calls `accept_case_once` over
    /// `wire`, logging and continuing on a failed handshake rather than giving up
    /// the listener. Returns the `JoinHandle` so the caller can abort it on shutdown.
    pub fn serve_case(self: Arc<Self>, wire: Arc<dyn Wire>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.accept_case_once(wire.clone()).await {
                    Ok(session) => {
                        log::debug!("accepted CASE session {}", session.session_id());
                    }
                    Err(e) => {
                        log::warn!("CASE responder: handshake failed: {}", e);
                    }
                }
            }
        })
    }
}

impl FabricLocator for MatterController {
    fn find_fabric_from_destination_id(&self, destination_id: &[u8], initiator_random: &[u8]) -> Option<Arc<Fabric>> {
        self.fabrics.find_fabric_from_destination_id(destination_id, initiator_random)
    }

    fn fabric_by_index(&self, index: u8) -> Option<Arc<Fabric>> {
        self.fabrics.fabric_by_index(index)
    }
}

impl ResumptionStore for MatterController {
    fn find_resumption_record_by_id(&self, resumption_id: &[u8]) -> Option<ResumptionRecord> {
        self.resumption.find_resumption_record_by_id(resumption_id)
    }

    fn save_resumption_record(&self, record: ResumptionRecord) {
        self.resumption.save_resumption_record(record)
    }

    fn remove_resumption_record(&self, resumption_id: &[u8]) {
        self.resumption.remove_resumption_record(resumption_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::loopback_pair;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedCertManager {
        ca_key: p256::SecretKey,
        user_key: p256::SecretKey,
        fabric_id: u64,
    }

    impl FixedCertManager {
        fn new(fabric_id: u64) -> Self {
            Self {
                ca_key: p256::SecretKey::random(&mut rand::thread_rng()),
                user_key: p256::SecretKey::random(&mut rand::thread_rng()),
                fabric_id,
            }
        }
    }

    impl CertManager for FixedCertManager {
        fn get_ca_cert(&self) -> anyhow::Result<Vec<u8>> {
            crate::cert_x509::encode_x509(&self.ca_key.public_key().to_sec1_bytes(), 1, self.fabric_id, 1, &self.ca_key, true)
        }
        fn get_ca_key(&self) -> anyhow::Result<p256::SecretKey> {
            Ok(self.ca_key.clone())
        }
        fn get_ca_public_key(&self) -> anyhow::Result<Vec<u8>> {
            Ok(self.ca_key.public_key().to_sec1_bytes().to_vec())
        }
        fn get_user_cert(&self, id: u64) -> anyhow::Result<Vec<u8>> {
            crate::cert_x509::encode_x509(&self.user_key.public_key().to_sec1_bytes(), id, self.fabric_id, 1, &self.ca_key, false)
        }
        fn get_user_key(&self, _id: u64) -> anyhow::Result<p256::SecretKey> {
            Ok(self.user_key.clone())
        }
        fn get_fabric_id(&self) -> u64 {
            self.fabric_id
        }
    }

    static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(9000);

    fn make_controller() -> Arc<MatterController> {
        let cert_manager: Arc<dyn CertManager> = Arc::new(FixedCertManager::new(42));
        let node_id = NEXT_NODE_ID.fetch_add(1, Ordering::SeqCst);
        MatterController::new(cert_manager, node_id, Vec::new()).expect("controller")
    }

    #[test]
    fn next_available_session_id_never_collides_with_a_registered_session() {
        let controller = make_controller();
        let first = controller.get_next_available_session_id();
        let (wire_a, _wire_b) = loopback_pair();
        controller.sessions.lock().unwrap().insert(
            first,
            Arc::new(ControllerSession {
                session_id: first,
                peer_node_id: None,
                fabric_index: None,
                provider: Arc::new(ExchangeProviderImpl::new(Arc::new(wire_a), Session::new())),
                subscriptions: controller.subscriptions.clone(),
            }),
        );
        let second = controller.get_next_available_session_id();
        assert_ne!(first, second);
    }

    #[test]
    fn fabric_locator_resolves_the_controllers_own_fabric_by_destination_id() {
        let controller = make_controller();
        let random = [9u8; 32];
        let dst = controller.fabric().destination_id(&random).expect("destination id");
        let found = controller.find_fabric_from_destination_id(&dst, &random);
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn accept_case_once_rejects_a_first_message_that_is_not_sigma1() {
        let controller = make_controller();
        let (wire_a, wire_b) = loopback_pair();
        let provider_b = ExchangeProviderImpl::new(Arc::new(wire_b), Session::new());

        let sender = async {
            let exchange = provider_b.open_exchange().await.expect("open exchange");
            let status = crate::messages::status_report_ok(
                exchange.id(),
                -1,
                ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL as u32,
                0,
            )
            .expect("status report");
            exchange.send(&status).await.expect("send status");
        };

        let (result, _) = tokio::join!(controller.accept_case_once(Arc::new(wire_a)), sender);
        assert!(matches!(
            result,
            Err(MatterError::ProtocolMismatch { expected: ProtocolMessageHeader::OPCODE_SIGMA1, .. })
        ));
    }

    fn linked_sessions() -> (Session, Session) {
        let key_ab = [5u8; 16];
        let key_ba = [6u8; 16];
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

    /// Regression test for a bug where `commission`/`accept_case_once` built the
    /// post-handshake `ExchangeProviderImpl` with a fresh, keyless `Session::new()`
    /// instead of the `Session` the handshake actually keyed, so every message a
    /// registered `ControllerSession` sent went out unencrypted. Exercises
    /// `register()` directly with a handshake-like keyed `Session` and confirms the
    /// peer, holding the matching decrypt key, can decrypt what the registered
    /// session's provider sends — which fails (the peer's AEAD tag check rejects an
    /// unencrypted payload) if `register()` is ever wired back to a keyless session.
    #[tokio::test]
    async fn registered_session_provider_sends_traffic_encrypted_with_the_handshake_keys() {
        let controller = make_controller();
        let (wire_a, wire_b) = loopback_pair();
        let (session_a, session_b) = linked_sessions();

        let provider_a = ExchangeProviderImpl::new(Arc::new(wire_a), session_a);
        let controller_session = controller.register(Some(77), None, provider_a);

        let provider_b = ExchangeProviderImpl::new(Arc::new(wire_b), session_b);

        let exchange_a = controller_session.provider.open_exchange().await.expect("open exchange");
        let status = crate::messages::status_report_ok(
            exchange_a.id(),
            -1,
            ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL as u32,
            0,
        )
        .expect("status report");
        let send_fut = exchange_a.send(&status);
        let recv_fut = tokio::time::timeout(std::time::Duration::from_secs(2), provider_b.next_unsolicited());

        let (send_result, recv_result) = tokio::join!(send_fut, recv_fut);
        send_result.expect("send should succeed");
        let inbound = recv_result
            .expect("peer should receive the message before the timeout")
            .expect("provider should decrypt it with the linked session's key");
        assert_eq!(inbound.protocol_header.opcode, ProtocolMessageHeader::OPCODE_STATUS);
        assert!(inbound.status_report_info.expect("status report info").is_ok());
    }
}
