use rsip::Method;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sip::{Dialog, SipReply, TransactionRecord, TransactionTicket};

use super::b2b::B2bSession;
use super::context::SessionContext;
use super::event::{B2bEvent, ConnectLeg, LegEvent};
use super::filter::{BodyMode, LegRole};

/// B-leg of a call, created by the caller.
pub struct CalleeSession {
    pub(super) base: B2bSession,
}

impl CalleeSession {
    pub fn new(
        context: SessionContext,
        dialog: Box<dyn Dialog>,
        caller_tag: String,
        body_mode: BodyMode,
    ) -> Self {
        let mut base = B2bSession::new(context, dialog, LegRole::BLeg);
        base.other_id = Some(caller_tag);
        base.body_mode = body_mode;
        Self { base }
    }

    pub fn base(&self) -> &B2bSession {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut B2bSession {
        &mut self.base
    }

    pub async fn process(&mut self, event: LegEvent) -> Result<()> {
        match event {
            LegEvent::SipRequest(request) => self.base.on_sip_request(request).await,
            LegEvent::SipReply(reply) => self.base.on_sip_reply(reply).await,
            LegEvent::B2b(B2bEvent::ConnectLeg(connect)) => self.on_connect_leg(connect).await,
            LegEvent::B2b(event) => self.base.on_b2b_event(event).await,
            LegEvent::ConnectCallee(_) => {
                warn!(local_tag = %self.base.local_tag(), "callee legs cannot connect further callees");
                Ok(())
            }
            LegEvent::SessionTimeout => {
                self.base.on_session_timeout().await;
                Ok(())
            }
            LegEvent::Refresh => {
                self.base.refresh().await;
                Ok(())
            }
        }
    }

    async fn on_connect_leg(&mut self, connect: ConnectLeg) -> Result<()> {
        info!(
            local_tag = %self.base.local_tag(),
            other_id = ?self.base.other_id(),
            remote_party = %connect.remote_party,
            remote_uri = %connect.remote_uri,
            "sending INVITE to callee"
        );

        self.base.dialog.set_remote_party(connect.remote_party);
        self.base.dialog.set_remote_uri(connect.remote_uri);

        let cseq = self.base.dialog.next_cseq();
        if connect.relayed_invite {
            self.base.relayed_req.insert(
                cseq,
                TransactionRecord::new(Method::Invite, connect.r_cseq, TransactionTicket::default()),
            );
        }

        let body = self.base.outbound_body(&connect.body, Method::Invite);
        match self
            .base
            .dialog
            .send_request(Method::Invite, &body, &connect.headers)
            .await
        {
            Ok(sent) => {
                if connect.relayed_invite
                    && sent != cseq
                    && let Some(record) = self.base.relayed_req.remove(cseq)
                {
                    self.base.relayed_req.insert(sent, record);
                }
            }
            Err(err) => {
                warn!(
                    local_tag = %self.base.local_tag(),
                    error = %err,
                    "sending INVITE failed, relaying 400 to caller"
                );
                let reply = SipReply::new(400, "Bad Request", connect.r_cseq, Method::Invite);
                self.base.relay_reply_event(reply, connect.relayed_invite);
                if connect.relayed_invite {
                    self.base.relayed_req.remove(cseq);
                }
                self.base.set_stopped();
                return Ok(());
            }
        }

        if self.base.refresh_method != crate::config::RefreshMethod::Update
            && !connect.body.is_empty()
        {
            debug!(local_tag = %self.base.local_tag(), "saving offer as established description");
            self.base.description.save(&connect.body);
        }
        Ok(())
    }
}
