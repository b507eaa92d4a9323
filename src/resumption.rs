//! Resumption records for fast CASE reconnects (spec 4.C "resume" path).
//!
//! A record is saved after a successful full CASE handshake and consulted on the next
//! sigma1 from the same peer so the expensive certificate/signature exchange can be
//! skipped in favour of a single sigma2Resume/sigma3 round trip.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Debug)]
pub struct ResumptionRecord {
    pub resumption_id: Vec<u8>,
    pub shared_secret: Vec<u8>,
    pub fabric_index: u8,
    pub peer_node_id: u64,
}

/// External collaborator: persists resumption records across CASE sessions.
///
/// The wire protocol keys lookups by `resumption_id` alone (16 bytes chosen by the
/// responder at full-handshake time); callers that also need a fabric/peer scoped
/// lookup (e.g. to evict a record when a fabric is removed) should keep their own index.
pub trait ResumptionStore: Send + Sync {
    fn find_resumption_record_by_id(&self, resumption_id: &[u8]) -> Option<ResumptionRecord>;
    fn save_resumption_record(&self, record: ResumptionRecord);
    fn remove_resumption_record(&self, resumption_id: &[u8]);
}

/// In-memory default, adequate for a controller process whose resumption state doesn't
/// need to survive a restart.
#[derive(Default)]
pub struct InMemoryResumptionStore {
    records: Mutex<HashMap<Vec<u8>, ResumptionRecord>>,
}

impl InMemoryResumptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResumptionStore for InMemoryResumptionStore {
    fn find_resumption_record_by_id(&self, resumption_id: &[u8]) -> Option<ResumptionRecord> {
        self.records.lock().unwrap().get(resumption_id).cloned()
    }

    fn save_resumption_record(&self, record: ResumptionRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.resumption_id.clone(), record);
    }

    fn remove_resumption_record(&self, resumption_id: &[u8]) {
        self.records.lock().unwrap().remove(resumption_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_find_round_trips() {
        let store = InMemoryResumptionStore::new();
        let rec = ResumptionRecord {
            resumption_id: vec![1, 2, 3, 4],
            shared_secret: vec![9; 32],
            fabric_index: 1,
            peer_node_id: 0xdead_beef,
        };
        store.save_resumption_record(rec.clone());
        let found = store.find_resumption_record_by_id(&[1, 2, 3, 4]).unwrap();
        assert_eq!(found.peer_node_id, rec.peer_node_id);
    }

    #[test]
    fn unknown_id_returns_none() {
        let store = InMemoryResumptionStore::new();
        assert!(store.find_resumption_record_by_id(&[0xff]).is_none());
    }

    #[test]
    fn remove_evicts_record() {
        let store = InMemoryResumptionStore::new();
        let rec = ResumptionRecord {
            resumption_id: vec![5],
            shared_secret: vec![],
            fabric_index: 0,
            peer_node_id: 1,
        };
        store.save_resumption_record(rec);
        store.remove_resumption_record(&[5]);
        assert!(store.find_resumption_record_by_id(&[5]).is_none());
    }
}
