//! CSeq bookkeeping between the two legs of a call.
//!
//! [`PendingRequests`] is keyed by this leg's inbound CSeq and holds requests
//! relayed to the other leg that still wait for a final response.
//! [`RelayedRequests`] is keyed by the CSeq this leg used when it re-sent a
//! request of the other leg, and maps it back to the peer's CSeq.

use std::collections::BTreeMap;

use rsip::Method;

use crate::error::{Error, Result};
use crate::sip::{SipRequest, TransactionRecord};

#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: BTreeMap<u32, SipRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `request`; returns the displaced entry if the CSeq was reused.
    pub fn insert(&mut self, request: SipRequest) -> Option<SipRequest> {
        self.entries.insert(request.cseq, request)
    }

    pub fn get(&self, cseq: u32) -> Option<&SipRequest> {
        self.entries.get(&cseq)
    }

    pub fn remove(&mut self, cseq: u32) -> Option<SipRequest> {
        self.entries.remove(&cseq)
    }

    pub fn contains(&self, cseq: u32) -> bool {
        self.entries.contains_key(&cseq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}

#[derive(Debug, Default)]
pub struct RelayedRequests {
    entries: BTreeMap<u32, TransactionRecord>,
}

impl RelayedRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cseq: u32, record: TransactionRecord) -> Option<TransactionRecord> {
        self.entries.insert(cseq, record)
    }

    pub fn get(&self, cseq: u32) -> Option<&TransactionRecord> {
        self.entries.get(&cseq)
    }

    pub fn remove(&mut self, cseq: u32) -> Option<TransactionRecord> {
        self.entries.remove(&cseq)
    }

    /// Keeps an INVITE record alive after its 2xx until the ACK is relayed.
    pub fn mark_answered(&mut self, cseq: u32) -> bool {
        match self.entries.get_mut(&cseq) {
            Some(record) => {
                record.answered = true;
                true
            }
            None => false,
        }
    }

    /// Own CSeq of the transaction relayed for the peer's `peer_cseq`.
    pub fn find_by_peer_cseq(&self, peer_cseq: u32) -> Option<(u32, &TransactionRecord)> {
        self.entries
            .iter()
            .find(|(_, record)| record.peer_cseq == peer_cseq)
            .map(|(cseq, record)| (*cseq, record))
    }

    /// Removes the answered INVITE an ACK with `peer_cseq` belongs to.
    pub fn take_for_ack(&mut self, peer_cseq: u32) -> Result<(u32, TransactionRecord)> {
        let cseq = self
            .entries
            .iter()
            .find(|(_, record)| {
                record.peer_cseq == peer_cseq && record.method == Method::Invite && record.answered
            })
            .map(|(cseq, _)| *cseq)
            .ok_or_else(|| {
                Error::inconsistency(format!(
                    "no answered INVITE for ACK with peer CSeq {peer_cseq}"
                ))
            })?;
        let record = self
            .entries
            .remove(&cseq)
            .ok_or_else(|| Error::inconsistency("relayed INVITE vanished"))?;
        Ok((cseq, record))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
