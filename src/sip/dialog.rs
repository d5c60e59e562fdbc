use async_trait::async_trait;
use rsip::{Headers, Method};

use crate::config::RefreshMethod;
use crate::error::Result;

use super::message::{MessageBody, SipRequest, TransactionTicket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogStatus {
    Disconnected,
    /// INVITE sent or received, no final 2xx yet.
    Early,
    Connected,
}

/// A client transaction this leg sent on behalf of the other leg.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub method: Method,
    /// CSeq of the originating request in the other leg.
    pub peer_cseq: u32,
    pub ticket: TransactionTicket,
    /// Set once a 2xx to an INVITE has been relayed and the ACK is still due.
    pub answered: bool,
}

impl TransactionRecord {
    pub fn new(method: Method, peer_cseq: u32, ticket: TransactionTicket) -> Self {
        Self {
            method,
            peer_cseq,
            ticket,
            answered: false,
        }
    }
}

/// Parameters for the dialog of a newly created callee leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogSetup {
    pub local_tag: String,
    pub call_id: String,
    pub local_party: String,
    pub remote_party: String,
    pub remote_uri: String,
}

/// SIP dialog owned by a single leg.
///
/// Implementations own retransmission, route sets and message serialization.
/// The engine only decides what to send.
#[async_trait]
pub trait Dialog: Send + 'static {
    fn local_tag(&self) -> &str;

    fn local_party(&self) -> &str;

    fn remote_party(&self) -> &str;

    fn local_uri(&self) -> &str;

    fn remote_uri(&self) -> &str;

    fn set_remote_party(&mut self, party: String);

    fn set_remote_uri(&mut self, uri: String);

    fn status(&self) -> DialogStatus;

    /// CSeq the next request sent on this dialog will carry.
    fn next_cseq(&self) -> u32;

    fn uac_invite_pending(&self) -> bool;

    /// Sends a request and returns the CSeq it was sent with.
    async fn send_request(
        &mut self,
        method: Method,
        body: &MessageBody,
        headers: &Headers,
    ) -> Result<u32>;

    async fn reply(
        &mut self,
        request: &SipRequest,
        code: u16,
        reason: &str,
        body: &MessageBody,
        headers: &Headers,
    ) -> Result<()>;

    /// ACK for a 2xx, sent on the transaction identified by `transaction`.
    async fn send_final_ack(
        &mut self,
        transaction: &TransactionRecord,
        cseq: u32,
        body: &MessageBody,
        headers: &Headers,
    ) -> Result<()>;

    async fn bye(&mut self) -> Result<()>;

    /// Plain single-dialog session refresh.
    async fn refresh(&mut self, method: RefreshMethod) -> Result<()>;
}

pub trait DialogFactory: Send + Sync + 'static {
    fn create_dialog(&self, setup: DialogSetup) -> Box<dyn Dialog>;
}
