//! Request and reply relaying between the two legs of a call.
//!
//! Each leg owns one [`B2bSession`]. SIP traffic received on the leg's dialog
//! is recorded in the ledgers and posted to the other leg as a [`B2bEvent`];
//! events coming from the other leg are re-sent on the own dialog with the
//! CSeq numbering translated back.

use rsip::{Header, Headers, Method};
use tracing::{debug, info, warn};

use crate::config::RefreshMethod;
use crate::error::{Error, Result};
use crate::media::RelayStreamSet;
use crate::sip::{
    Dialog, DialogStatus, MessageBody, SipReply, SipRequest, TransactionRecord,
    TransactionTicket, allows_update, is_offer_answer,
};

use super::context::SessionContext;
use super::description::DescriptionCache;
use super::event::{B2bEvent, LegEvent};
use super::filter::{BodyMode, FilterDirection, LegRole};
use super::ledger::{PendingRequests, RelayedRequests};

pub struct B2bSession {
    pub(super) context: SessionContext,
    pub(super) dialog: Box<dyn Dialog>,
    local_tag: String,
    pub(super) other_id: Option<String>,
    pub(super) sip_relay_only: bool,
    pub(super) body_mode: BodyMode,
    pub(super) rtp_relay_enabled: bool,
    role: LegRole,
    pub(super) refresh_method: RefreshMethod,
    pub(super) recvd_req: PendingRequests,
    pub(super) relayed_req: RelayedRequests,
    pub(super) description: DescriptionCache,
    pub(super) relay_streams: RelayStreamSet,
    stopped: bool,
}

impl B2bSession {
    pub fn new(context: SessionContext, dialog: Box<dyn Dialog>, role: LegRole) -> Self {
        let session = &context.config.session;
        let body_mode = BodyMode::from_config(session);
        let rtp_relay_enabled = session.rtp_relay;
        let refresh_method = session.refresh_method;
        let relay_streams = context.new_relay_streams();
        let local_tag = dialog.local_tag().to_string();

        Self {
            context,
            dialog,
            local_tag,
            other_id: None,
            sip_relay_only: true,
            body_mode,
            rtp_relay_enabled,
            role,
            refresh_method,
            recvd_req: PendingRequests::new(),
            relayed_req: RelayedRequests::new(),
            description: DescriptionCache::new(),
            relay_streams,
            stopped: false,
        }
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn other_id(&self) -> Option<&str> {
        self.other_id.as_deref()
    }

    pub fn role(&self) -> LegRole {
        self.role
    }

    pub fn dialog(&self) -> &dyn Dialog {
        self.dialog.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn set_stopped(&mut self) {
        self.stopped = true;
    }

    /// A stopped leg is done once its dialog is gone.
    pub fn is_finished(&self) -> bool {
        self.stopped && self.dialog.status() == DialogStatus::Disconnected
    }

    pub fn sip_relay_only(&self) -> bool {
        self.sip_relay_only
    }

    pub fn set_sip_relay_only(&mut self, relay_only: bool) {
        self.sip_relay_only = relay_only;
    }

    pub fn body_mode(&self) -> &BodyMode {
        &self.body_mode
    }

    pub fn rtp_relay_enabled(&self) -> bool {
        self.rtp_relay_enabled
    }

    pub fn refresh_method(&self) -> RefreshMethod {
        self.refresh_method
    }

    pub fn pending_requests(&self) -> &PendingRequests {
        &self.recvd_req
    }

    pub fn relayed_requests(&self) -> &RelayedRequests {
        &self.relayed_req
    }

    pub fn description(&self) -> &DescriptionCache {
        &self.description
    }

    pub fn relay_streams(&self) -> &RelayStreamSet {
        &self.relay_streams
    }

    fn filter_direction(&self) -> FilterDirection {
        self.role.into()
    }

    fn update_refresh_method(&mut self, headers: &Headers) {
        if self.context.config.session.refresh_method != RefreshMethod::UpdateFallbackInvite {
            return;
        }
        if let Some(allowed) = allows_update(headers) {
            let method = if allowed {
                RefreshMethod::Update
            } else {
                RefreshMethod::Invite
            };
            if method != self.refresh_method {
                debug!(local_tag = %self.local_tag, ?method, "learned session refresh method");
            }
            self.refresh_method = method;
        }
    }

    fn caches_descriptions(&self) -> bool {
        self.refresh_method != RefreshMethod::Update
    }

    pub(super) fn filter_body(&self, body: &mut MessageBody) {
        if let Err(err) = self.body_mode.apply(body, self.filter_direction()) {
            debug!(local_tag = %self.local_tag, error = %err, "SDP filtering failed, body relayed unfiltered");
        }
    }

    /// Body as it goes out on this leg: with relay addresses when RTP relay
    /// is on, untouched otherwise or when substitution fails.
    pub(super) fn outbound_body(&self, body: &MessageBody, method: Method) -> MessageBody {
        if self.rtp_relay_enabled && is_offer_answer(method) && !body.is_empty() {
            match self.relay_streams.rewrite(body) {
                Ok(data) => return body.with_data(data),
                Err(err) => {
                    debug!(local_tag = %self.local_tag, error = %err, "relay address not substituted, sending original body")
                }
            }
        }
        body.clone()
    }

    /// Posts `event` to the other leg. Without a peer the event is dropped.
    pub fn relay_event(&mut self, event: B2bEvent) -> Result<()> {
        if self.other_id.is_none() && self.role == LegRole::ALeg && event.needs_callee() {
            super::caller::create_callee_session(self)?;
        }

        match &self.other_id {
            Some(other) => {
                debug!(local_tag = %self.local_tag, other_id = %other, kind = event.kind(), "relaying event");
                self.context.registry.post_event(other, LegEvent::B2b(event))
            }
            None => {
                debug!(local_tag = %self.local_tag, kind = event.kind(), "no other leg, event discarded");
                Ok(())
            }
        }
    }

    pub(super) fn relay_or_warn(&mut self, event: B2bEvent) {
        let kind = event.kind();
        if let Err(err) = self.relay_event(event) {
            warn!(local_tag = %self.local_tag, kind, error = %err, "failed to relay event to other leg");
        }
    }

    /// Relays a reply produced by this leg, stamped with this leg's tag.
    pub(super) fn relay_reply_event(&mut self, mut reply: SipReply, forward: bool) {
        reply.local_tag = self.local_tag.clone();
        self.relay_or_warn(B2bEvent::SipReply { reply, forward });
    }

    pub async fn on_sip_request(&mut self, request: SipRequest) -> Result<()> {
        let forward =
            self.sip_relay_only && !matches!(request.method, Method::Bye | Method::Cancel);
        debug!(
            local_tag = %self.local_tag,
            method = %request.method,
            cseq = request.cseq,
            forward,
            "received request"
        );

        if forward {
            self.update_refresh_method(&request.headers);
            if request.method != Method::Ack
                && self.recvd_req.insert(request.clone()).is_some()
            {
                warn!(local_tag = %self.local_tag, cseq = request.cseq, "pending request replaced by reused CSeq");
            }
        } else {
            self.on_local_request(&request).await?;
        }

        let mut relayed = request;
        if forward && !self.body_mode.is_transparent() && relayed.is_offer_answer() {
            self.filter_body(&mut relayed.body);
        }
        if self.rtp_relay_enabled && relayed.is_offer_answer() {
            self.relay_streams.learn_from_body(&relayed.body);
        }

        let cseq = relayed.cseq;
        let method = relayed.method;
        if let Err(err) = self.relay_event(B2bEvent::SipRequest {
            request: relayed,
            forward,
        }) {
            warn!(local_tag = %self.local_tag, cseq, %method, error = %err, "request not relayed");
            if forward {
                self.recvd_req.remove(cseq);
            }
        }
        Ok(())
    }

    async fn on_local_request(&mut self, request: &SipRequest) -> Result<()> {
        let empty = MessageBody::default();
        let headers = Headers::default();
        match request.method {
            Method::Bye => {
                self.dialog.reply(request, 200, "OK", &empty, &headers).await?;
                self.stop();
            }
            Method::Cancel => {
                self.dialog.reply(request, 200, "OK", &empty, &headers).await?;
                self.stopped = true;
                if self.other_id.is_none() {
                    self.relay_streams.release();
                }
            }
            Method::PRack | Method::Info => {
                self.dialog.reply(request, 200, "OK", &empty, &headers).await?;
            }
            Method::Invite | Method::Ack => {
                debug!(local_tag = %self.local_tag, method = %request.method, "left to the session owner");
            }
            _ => {
                self.dialog
                    .reply(request, 501, "Not Implemented", &empty, &headers)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn on_b2b_event(&mut self, event: B2bEvent) -> Result<()> {
        match event {
            B2bEvent::SipRequest { request, forward } => {
                self.on_b2b_sip_request(request, forward).await
            }
            B2bEvent::SipReply { reply, forward } => self.on_b2b_sip_reply(reply, forward).await,
            B2bEvent::TerminateLeg => {
                self.terminate_leg().await;
                Ok(())
            }
            B2bEvent::ConnectLeg(_) => {
                warn!(local_tag = %self.local_tag, "connect request on a leg that cannot connect");
                Ok(())
            }
        }
    }

    async fn on_b2b_sip_request(&mut self, request: SipRequest, forward: bool) -> Result<()> {
        debug!(
            local_tag = %self.local_tag,
            method = %request.method,
            cseq = request.cseq,
            forward,
            "request from other leg"
        );

        if forward {
            if request.method == Method::Invite && self.dialog.uac_invite_pending() {
                debug!(local_tag = %self.local_tag, cseq = request.cseq, "INVITE transaction pending, answering 491");
                let reply = SipReply::new(491, "Request Pending", request.cseq, Method::Invite);
                self.relay_reply_event(reply, true);
                return Ok(());
            }
            return self.relay_request(request).await;
        }

        if matches!(request.method, Method::Bye | Method::Cancel) {
            self.on_other_bye().await;
        }
        Ok(())
    }

    async fn on_other_bye(&mut self) {
        debug!(local_tag = %self.local_tag, "other leg ended the call");
        self.terminate_leg().await;
    }

    /// Re-sends a request of the other leg on this leg's dialog.
    async fn relay_request(&mut self, request: SipRequest) -> Result<()> {
        if request.method == Method::Ack {
            let (cseq, record) = self.relayed_req.take_for_ack(request.cseq)?;
            let body = self.outbound_body(&request.body, Method::Ack);
            self.dialog
                .send_final_ack(&record, cseq, &body, &request.headers)
                .await?;
            if self.caches_descriptions() && !request.body.is_empty() {
                self.description.save(&request.body);
            }
            return Ok(());
        }

        let cseq = self.dialog.next_cseq();
        self.relayed_req.insert(
            cseq,
            TransactionRecord::new(request.method, request.cseq, request.ticket),
        );

        let mut headers = request.headers.clone();
        if request.method == Method::PRack
            && let Some(rack) = &request.rack
        {
            match self.relayed_req.find_by_peer_cseq(rack.cseq) {
                Some((own_cseq, _)) => {
                    headers = Headers::default();
                    for header in request.headers.iter() {
                        if !matches!(header, Header::Other(name, _) if name.eq_ignore_ascii_case("RAck")) {
                            headers.push(header.clone());
                        }
                    }
                    headers.push(Header::Other(
                        "RAck".into(),
                        format!("{} {} {}", rack.rseq, own_cseq, rack.method),
                    ));
                }
                None => {
                    warn!(local_tag = %self.local_tag, rack_cseq = rack.cseq, "PRACK for unknown transaction, RAck left as is")
                }
            }
        }

        let body = self.outbound_body(&request.body, request.method);
        match self.dialog.send_request(request.method, &body, &headers).await {
            Ok(sent) => {
                if sent != cseq
                    && let Some(record) = self.relayed_req.remove(cseq)
                {
                    self.relayed_req.insert(sent, record);
                }
            }
            Err(err) => {
                self.relayed_req.remove(cseq);
                warn!(
                    local_tag = %self.local_tag,
                    method = %request.method,
                    error = %err,
                    "relaying request failed, answering 500 to other leg"
                );
                let reply = SipReply::new(500, "Server Internal Error", request.cseq, request.method);
                self.relay_reply_event(reply, true);
                return Ok(());
            }
        }

        if self.caches_descriptions()
            && matches!(request.method, Method::Invite | Method::Update)
            && !request.body.is_empty()
        {
            self.description.save(&request.body);
        }
        Ok(())
    }

    pub async fn on_sip_reply(&mut self, reply: SipReply) -> Result<()> {
        let relayed = self.relayed_req.get(reply.cseq).cloned();
        let was_relayed = relayed.is_some();
        debug!(
            local_tag = %self.local_tag,
            code = reply.code,
            reason = %reply.reason,
            cseq = reply.cseq,
            method = %reply.method,
            relayed = was_relayed,
            "received reply"
        );

        match relayed {
            Some(record) if reply.code != 100 => {
                self.update_refresh_method(&reply.headers);

                let mut forwarded = reply.clone();
                forwarded.cseq = record.peer_cseq;
                forwarded.method = record.method;
                if !self.body_mode.is_transparent()
                    && matches!(reply.method, Method::Invite | Method::Update)
                {
                    self.filter_body(&mut forwarded.body);
                }
                if self.rtp_relay_enabled
                    && (180..300).contains(&reply.code)
                    && matches!(reply.method, Method::Invite | Method::Update)
                {
                    self.relay_streams.learn_from_body(&forwarded.body);
                }

                if reply.is_final() {
                    if reply.is_success() && record.method == Method::Invite {
                        self.relayed_req.mark_answered(reply.cseq);
                        debug!(local_tag = %self.local_tag, cseq = reply.cseq, "INVITE answered, keeping record until ACK");
                    } else {
                        self.relayed_req.remove(reply.cseq);
                    }
                }
                self.relay_reply_event(forwarded, true);
            }
            _ => {
                if reply.method == Method::Invite && reply.is_success() && !was_relayed {
                    let record =
                        TransactionRecord::new(Method::Invite, reply.cseq, TransactionTicket::default());
                    if let Err(err) = self
                        .dialog
                        .send_final_ack(&record, reply.cseq, &MessageBody::default(), &Headers::default())
                        .await
                    {
                        warn!(local_tag = %self.local_tag, cseq = reply.cseq, error = %err, "failed to ACK local INVITE");
                    }
                }
                self.relay_reply_event(reply, false);
            }
        }
        Ok(())
    }

    async fn on_b2b_sip_reply(&mut self, reply: SipReply, forward: bool) -> Result<()> {
        debug!(
            local_tag = %self.local_tag,
            code = reply.code,
            reason = %reply.reason,
            cseq = reply.cseq,
            forward,
            "reply from other leg"
        );

        if !forward {
            return self.sync_with_peer_answer(&reply).await;
        }

        let request = self.recvd_req.get(reply.cseq).cloned().ok_or_else(|| {
            Error::inconsistency(format!("no pending request with CSeq {}", reply.cseq))
        })?;

        let result = self.relay_reply(&request, &reply).await;
        if reply.is_final() {
            self.recvd_req.remove(reply.cseq);
            if request.method == Method::Invite && reply.code == 487 {
                debug!(local_tag = %self.local_tag, "INVITE cancelled by other leg");
                self.terminate_leg().await;
            }
        }
        result
    }

    /// A 2xx the other leg handled itself may still have changed the media;
    /// push the new description to this side.
    async fn sync_with_peer_answer(&mut self, reply: &SipReply) -> Result<()> {
        if self.stopped
            || !reply.is_success()
            || reply.body.is_empty()
            || !matches!(reply.method, Method::Invite | Method::Update)
        {
            return Ok(());
        }
        if !self.description.update(&reply.body) {
            return Ok(());
        }
        if self.dialog.uac_invite_pending() {
            debug!(local_tag = %self.local_tag, "session description changed, INVITE pending; not updating this leg");
            return Ok(());
        }
        debug!(local_tag = %self.local_tag, "session description changed, sending re-INVITE");
        self.send_established_reinvite().await
    }

    async fn relay_reply(&mut self, request: &SipRequest, reply: &SipReply) -> Result<()> {
        let mut headers = reply.headers.clone();
        if let Some(rseq) = reply.rseq {
            headers.push(Header::Other("RSeq".into(), rseq.to_string()));
        }
        let body = self.outbound_body(&reply.body, request.method);
        self.dialog
            .reply(request, reply.code, &reply.reason, &body, &headers)
            .await?;

        if self.caches_descriptions()
            && matches!(request.method, Method::Invite | Method::Update)
            && !reply.body.is_empty()
        {
            self.description.save(&reply.body);
        }
        Ok(())
    }

    /// Sends a re-INVITE with the last negotiated description.
    pub async fn send_established_reinvite(&mut self) -> Result<()> {
        let Some(established) = self.description.established() else {
            return Err(Error::dialog("no established session description"));
        };
        let body = self.outbound_body(&established, Method::Invite);
        self.dialog
            .send_request(Method::Invite, &body, &Headers::default())
            .await?;
        Ok(())
    }

    /// Session refresh. Returns whether a refresh was sent.
    pub async fn refresh(&mut self) -> bool {
        if self.dialog.status() != DialogStatus::Connected {
            return false;
        }

        if self.other_id.is_none() || self.refresh_method == RefreshMethod::Update {
            return match self.dialog.refresh(self.refresh_method).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(local_tag = %self.local_tag, error = %err, "session refresh failed");
                    false
                }
            };
        }

        if self.dialog.uac_invite_pending() {
            debug!(local_tag = %self.local_tag, "INVITE transaction pending, refresh skipped");
            return false;
        }

        match self.send_established_reinvite().await {
            Ok(()) => true,
            Err(err) => {
                warn!(local_tag = %self.local_tag, error = %err, "re-INVITE refresh failed");
                false
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.relay_streams.release();
    }

    /// Stops this leg and hangs up its dialog if it is still up.
    pub async fn terminate_leg(&mut self) {
        if !self.stopped {
            info!(local_tag = %self.local_tag, "terminating leg");
        }
        self.stop();
        if matches!(
            self.dialog.status(),
            DialogStatus::Early | DialogStatus::Connected
        ) && let Err(err) = self.dialog.bye().await
        {
            warn!(local_tag = %self.local_tag, error = %err, "failed to send BYE");
        }
    }

    pub fn terminate_other_leg(&mut self) {
        if self.other_id.is_some() {
            self.relay_or_warn(B2bEvent::TerminateLeg);
        }
        self.other_id = None;
    }

    pub async fn on_session_timeout(&mut self) {
        debug!(local_tag = %self.local_tag, "session timer expired");
        self.terminate_other_leg();
        self.terminate_leg().await;
    }

    /// Final cleanup once the leg is done.
    pub fn teardown(&mut self) {
        self.relay_streams.release();
        let pending = self.recvd_req.clear();
        let relayed = self.relayed_req.clear();
        debug!(local_tag = %self.local_tag, pending, relayed, "cleared transaction ledgers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdp::APPLICATION_SDP;
    use crate::session::testing::{DialogAction, FakeDialog, test_context};
    use crate::sip::RAck;

    const OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 192.0.2.10\r\n\
s=-\r\n\
c=IN IP4 192.0.2.10\r\n\
t=0 0\r\n\
m=audio 4000 RTP/AVP 0\r\n";

    const ANSWER: &str = "v=0\r\n\
o=- 2 2 IN IP4 192.0.2.20\r\n\
s=-\r\n\
c=IN IP4 192.0.2.20\r\n\
t=0 0\r\n\
m=audio 5000 RTP/AVP 0\r\n";

    const NEW_ANSWER: &str = "v=0\r\n\
o=- 2 3 IN IP4 192.0.2.20\r\n\
s=-\r\n\
c=IN IP4 192.0.2.20\r\n\
t=0 0\r\n\
m=audio 5002 RTP/AVP 0\r\n";

    fn sdp(data: &str) -> MessageBody {
        MessageBody::new(APPLICATION_SDP, data)
    }

    /// Callee side session with a peer called "peer".
    fn linked_session(
        fakes: &crate::session::testing::TestFakes,
        tag: &str,
    ) -> (B2bSession, crate::session::testing::DialogHandle) {
        let (dialog, handle) = FakeDialog::new(tag);
        let mut session = B2bSession::new(fakes.context.clone(), Box::new(dialog), LegRole::BLeg);
        session.other_id = Some("peer".into());
        (session, handle)
    }

    #[tokio::test]
    async fn cseq_mapped_both_ways() {
        let (fakes, registry) = test_context(false);
        let (mut session, handle) = linked_session(&fakes, "b");
        handle.set_next_cseq(5);

        let invite = SipRequest::new(Method::Invite, 101).with_body(sdp(OFFER));
        session.on_b2b_sip_request(invite, true).await.unwrap();
        assert_eq!(session.relayed_req.get(5).unwrap().peer_cseq, 101);

        let ok = SipReply::new(200, "OK", 5, Method::Invite).with_body(sdp(ANSWER));
        session.on_sip_reply(ok).await.unwrap();

        let posted = registry.take_posted();
        assert_eq!(posted.len(), 1);
        let (target, LegEvent::B2b(B2bEvent::SipReply { reply, forward })) = &posted[0] else {
            panic!("expected relayed reply, got {posted:?}");
        };
        assert_eq!(target, "peer");
        assert!(*forward);
        assert_eq!(reply.cseq, 101);
        assert_eq!(reply.local_tag, "b");
        // 2xx INVITE record kept until the ACK
        assert!(session.relayed_req.get(5).unwrap().answered);

        let ack = SipRequest::new(Method::Ack, 101);
        session.on_b2b_sip_request(ack, true).await.unwrap();
        assert!(session.relayed_req.is_empty());
        assert!(handle.actions().iter().any(|action| matches!(
            action,
            DialogAction::FinalAck { cseq: 5, peer_cseq: 101, .. }
        )));
    }

    #[tokio::test]
    async fn pending_entry_removed_on_final_reply() {
        let (fakes, registry) = test_context(false);
        let (dialog, handle) = FakeDialog::new("a");
        let mut session = B2bSession::new(fakes.context.clone(), Box::new(dialog), LegRole::ALeg);
        session.other_id = Some("peer".into());

        let info = SipRequest::new(Method::Info, 7);
        session.on_sip_request(info).await.unwrap();
        assert!(session.recvd_req.contains(7));
        assert_eq!(registry.take_posted().len(), 1);

        let trying = SipReply::new(183, "Progress", 7, Method::Info);
        session.on_b2b_event(B2bEvent::SipReply { reply: trying, forward: true }).await.unwrap();
        assert!(session.recvd_req.contains(7));

        let ok = SipReply::new(200, "OK", 7, Method::Info);
        session.on_b2b_event(B2bEvent::SipReply { reply: ok.clone(), forward: true }).await.unwrap();
        assert!(!session.recvd_req.contains(7));

        let err = session
            .on_b2b_event(B2bEvent::SipReply { reply: ok, forward: true })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolInconsistency(_)));
        let replies = handle
            .actions()
            .into_iter()
            .filter(|action| matches!(action, DialogAction::Reply { .. }))
            .count();
        assert_eq!(replies, 2);
    }

    #[tokio::test]
    async fn ack_never_recorded_as_pending() {
        let (fakes, _registry) = test_context(false);
        let (dialog, _handle) = FakeDialog::new("a");
        let mut session = B2bSession::new(fakes.context.clone(), Box::new(dialog), LegRole::ALeg);
        session.other_id = Some("peer".into());

        session.on_sip_request(SipRequest::new(Method::Ack, 3)).await.unwrap();
        assert!(session.recvd_req.is_empty());
    }

    #[tokio::test]
    async fn stray_ack_is_an_inconsistency() {
        let (fakes, _registry) = test_context(false);
        let (mut session, handle) = linked_session(&fakes, "b");
        handle.set_next_cseq(2);
        session
            .on_b2b_sip_request(SipRequest::new(Method::Invite, 40), true)
            .await
            .unwrap();

        let err = session
            .on_b2b_sip_request(SipRequest::new(Method::Ack, 40), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolInconsistency(_)));
        assert_eq!(session.relayed_req.len(), 1);
    }

    #[tokio::test]
    async fn invite_during_pending_invite_gets_491() {
        let (fakes, registry) = test_context(false);
        let (mut session, handle) = linked_session(&fakes, "b");
        handle.set_invite_pending(true);

        session
            .on_b2b_sip_request(SipRequest::new(Method::Invite, 9), true)
            .await
            .unwrap();

        assert!(handle.requests().is_empty());
        assert!(session.relayed_req.is_empty());
        let posted = registry.take_posted();
        let (_, LegEvent::B2b(B2bEvent::SipReply { reply, forward })) = &posted[0] else {
            panic!("expected 491");
        };
        assert_eq!((reply.code, reply.cseq, reply.method), (491, 9, Method::Invite));
        assert_eq!(reply.local_tag, "b");
        assert!(*forward);
    }

    #[tokio::test]
    async fn failed_relay_answers_500_to_other_leg() {
        let (fakes, registry) = test_context(false);
        let (mut session, handle) = linked_session(&fakes, "b");
        handle.fail_requests(true);

        session
            .on_b2b_sip_request(SipRequest::new(Method::Info, 12), true)
            .await
            .unwrap();
        assert!(session.relayed_req.is_empty());
        let posted = registry.take_posted();
        let (_, LegEvent::B2b(B2bEvent::SipReply { reply, .. })) = &posted[0] else {
            panic!("expected error reply");
        };
        assert_eq!((reply.code, reply.cseq), (500, 12));
    }

    #[tokio::test]
    async fn prack_rack_translated() {
        let (fakes, _registry) = test_context(false);
        let (mut session, handle) = linked_session(&fakes, "b");
        handle.set_next_cseq(30);

        session
            .on_b2b_sip_request(SipRequest::new(Method::Invite, 1), true)
            .await
            .unwrap();
        let prack = SipRequest::new(Method::PRack, 2).with_rack(RAck {
            rseq: 77,
            cseq: 1,
            method: Method::Invite,
        });
        session.on_b2b_sip_request(prack, true).await.unwrap();

        let requests = handle.requests();
        let (method, _, headers) = &requests[1];
        assert_eq!(*method, Method::PRack);
        assert!(headers.iter().any(|header| matches!(
            header,
            Header::Other(name, value) if name == "RAck" && value == "77 30 INVITE"
        )));
    }

    #[tokio::test]
    async fn reliable_provisional_carries_rseq() {
        let (fakes, _registry) = test_context(false);
        let (dialog, handle) = FakeDialog::new("a");
        let mut session = B2bSession::new(fakes.context.clone(), Box::new(dialog), LegRole::ALeg);
        session.other_id = Some("peer".into());
        session
            .on_sip_request(SipRequest::new(Method::Invite, 1))
            .await
            .unwrap();

        let ringing = SipReply::new(180, "Ringing", 1, Method::Invite).with_rseq(4);
        session.on_b2b_sip_reply(ringing, true).await.unwrap();
        let Some(DialogAction::Reply { code, headers, .. }) = handle.actions().pop() else {
            panic!("expected reply");
        };
        assert_eq!(code, 180);
        assert!(headers.iter().any(|header| matches!(
            header,
            Header::Other(name, value) if name == "RSeq" && value == "4"
        )));
    }

    #[tokio::test]
    async fn bye_handled_locally_and_signalled() {
        let (fakes, registry) = test_context(false);
        let (dialog, handle) = FakeDialog::new("a");
        let mut session = B2bSession::new(fakes.context.clone(), Box::new(dialog), LegRole::ALeg);
        session.other_id = Some("peer".into());

        session.on_sip_request(SipRequest::new(Method::Bye, 8)).await.unwrap();
        assert!(session.is_stopped());
        assert!(session.recvd_req.is_empty());
        assert!(matches!(
            handle.actions().first(),
            Some(DialogAction::Reply { code: 200, .. })
        ));

        let posted = registry.take_posted();
        let (_, LegEvent::B2b(B2bEvent::SipRequest { request, forward })) = &posted[0] else {
            panic!("expected relayed BYE");
        };
        assert_eq!(request.method, Method::Bye);
        assert!(!*forward);
    }

    #[tokio::test]
    async fn unknown_local_request_gets_501() {
        let (fakes, _registry) = test_context(false);
        let (dialog, handle) = FakeDialog::new("a");
        let mut session = B2bSession::new(fakes.context.clone(), Box::new(dialog), LegRole::ALeg);
        session.set_sip_relay_only(false);

        session
            .on_sip_request(SipRequest::new(Method::Message, 4))
            .await
            .unwrap();
        assert!(matches!(
            handle.actions().first(),
            Some(DialogAction::Reply { code: 501, .. })
        ));
        assert!(!session.is_stopped());
    }

    #[tokio::test]
    async fn other_bye_terminates_connected_leg() {
        let (fakes, _registry) = test_context(false);
        let (mut session, handle) = linked_session(&fakes, "b");
        handle.set_status(DialogStatus::Connected);

        session
            .on_b2b_event(B2bEvent::SipRequest {
                request: SipRequest::new(Method::Bye, 3),
                forward: false,
            })
            .await
            .unwrap();
        assert!(session.is_finished());
        assert!(handle.actions().iter().any(DialogAction::is_bye));

        // terminating twice sends nothing more
        session.terminate_leg().await;
        assert_eq!(handle.actions().iter().filter(|a| a.is_bye()).count(), 1);
    }

    #[tokio::test]
    async fn peer_answer_change_triggers_reinvite() {
        let (fakes, _registry) = test_context(false);
        let (mut session, handle) = linked_session(&fakes, "b");
        session.description.save(&sdp(ANSWER));

        let same = SipReply::new(200, "OK", 3, Method::Invite).with_body(sdp(ANSWER));
        session.on_b2b_sip_reply(same, false).await.unwrap();
        assert!(handle.requests().is_empty());

        let changed = SipReply::new(200, "OK", 4, Method::Invite).with_body(sdp(NEW_ANSWER));
        session.on_b2b_sip_reply(changed, false).await.unwrap();
        let requests = handle.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, Method::Invite);
        assert_eq!(requests[0].1.data, NEW_ANSWER);
    }

    #[tokio::test]
    async fn peer_answer_change_deferred_while_invite_pending() {
        let (fakes, _registry) = test_context(false);
        let (mut session, handle) = linked_session(&fakes, "b");
        session.description.save(&sdp(ANSWER));
        handle.set_invite_pending(true);

        let changed = SipReply::new(200, "OK", 4, Method::Invite).with_body(sdp(NEW_ANSWER));
        session.on_b2b_sip_reply(changed, false).await.unwrap();
        assert!(handle.requests().is_empty());
        assert_eq!(session.description.established().unwrap().data, NEW_ANSWER);
    }

    #[tokio::test]
    async fn local_invite_2xx_is_acked() {
        let (fakes, registry) = test_context(false);
        let (mut session, handle) = linked_session(&fakes, "b");

        let ok = SipReply::new(200, "OK", 2, Method::Invite);
        session.on_sip_reply(ok).await.unwrap();
        assert!(matches!(
            handle.actions().first(),
            Some(DialogAction::FinalAck { cseq: 2, .. })
        ));
        let posted = registry.take_posted();
        assert!(matches!(
            &posted[0].1,
            LegEvent::B2b(B2bEvent::SipReply { forward: false, .. })
        ));
    }

    #[tokio::test]
    async fn refresh_rules() {
        let (fakes, _registry) = test_context(false);
        let (mut session, handle) = linked_session(&fakes, "b");

        assert!(!session.refresh().await);

        handle.set_status(DialogStatus::Connected);
        session.description.save(&sdp(OFFER));
        handle.set_invite_pending(true);
        assert!(!session.refresh().await);

        handle.set_invite_pending(false);
        assert!(session.refresh().await);
        assert_eq!(handle.requests()[0].0, Method::Invite);

        session.other_id = None;
        assert!(session.refresh().await);
        assert!(handle.actions().iter().any(|action| matches!(
            action,
            DialogAction::Refresh(RefreshMethod::Invite)
        )));
    }

    #[tokio::test]
    async fn refresh_method_learned_from_allow() {
        let mut config = crate::session::testing::test_config(false);
        config.session.refresh_method = RefreshMethod::UpdateFallbackInvite;
        let (fakes, _registry) = crate::session::testing::test_context_from(config);
        let (mut session, handle) = linked_session(&fakes, "b");
        handle.set_next_cseq(1);
        session
            .on_b2b_sip_request(SipRequest::new(Method::Invite, 60), true)
            .await
            .unwrap();
        handle.set_status(DialogStatus::Connected);

        let ok = SipReply::new(200, "OK", 1, Method::Invite)
            .with_header(Header::Other("Allow".into(), "INVITE, ACK, UPDATE".into()));
        session.on_sip_reply(ok).await.unwrap();
        assert_eq!(session.refresh_method(), RefreshMethod::Update);

        assert!(session.refresh().await);
        assert!(handle.actions().iter().any(|action| matches!(
            action,
            DialogAction::Refresh(RefreshMethod::Update)
        )));
    }

    #[tokio::test]
    async fn relay_without_peer_is_discarded() {
        let (fakes, registry) = test_context(false);
        let (dialog, _handle) = FakeDialog::new("b");
        let mut session = B2bSession::new(fakes.context.clone(), Box::new(dialog), LegRole::BLeg);

        session.relay_event(B2bEvent::TerminateLeg).unwrap();
        assert!(registry.take_posted().is_empty());

        session.other_id = Some("gone".into());
        registry.mark_gone("gone");
        assert!(matches!(
            session.relay_event(B2bEvent::TerminateLeg),
            Err(Error::PeerGone(_))
        ));
    }

    #[tokio::test]
    async fn terminate_other_leg_forgets_gone_peer() {
        let (fakes, registry) = test_context(false);
        let (dialog, _handle) = FakeDialog::new("a");
        let mut session = B2bSession::new(fakes.context.clone(), Box::new(dialog), LegRole::ALeg);
        session.other_id = Some("gone".into());
        registry.mark_gone("gone");

        session.terminate_other_leg();
        assert!(session.other_id().is_none());
        assert!(registry.take_posted().is_empty());
    }

    #[tokio::test]
    async fn teardown_clears_ledgers() {
        let (fakes, _registry) = test_context(false);
        let (mut session, _handle) = linked_session(&fakes, "b");
        session
            .on_b2b_sip_request(SipRequest::new(Method::Invite, 1), true)
            .await
            .unwrap();
        session.recvd_req.insert(SipRequest::new(Method::Info, 2));

        session.teardown();
        assert!(session.relayed_req.is_empty());
        assert!(session.recvd_req.is_empty());
    }
}
