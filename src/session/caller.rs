use rsip::{Headers, Method};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::sip::{DialogSetup, SipReply, SipRequest};

use super::b2b::B2bSession;
use super::callee::CalleeSession;
use super::context::SessionContext;
use super::event::{B2bEvent, CalleeTarget, ConnectLeg, LegEvent};
use super::filter::LegRole;
use super::leg::Leg;

/// Progress of the callee the caller is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalleeStatus {
    #[default]
    None,
    AwaitingFirstReply,
    Ringing,
    Connected,
}

/// A-leg of a call. Owns the caller's dialog and creates the callee.
pub struct CallerSession {
    pub(super) base: B2bSession,
    invite_req: Option<SipRequest>,
    callee_status: CalleeStatus,
    relay_early_media_sdp: bool,
}

impl CallerSession {
    pub fn new(context: SessionContext, dialog: Box<dyn crate::sip::Dialog>) -> Self {
        let session = &context.config.session;
        let relay_only = session.relay_only;
        let relay_early_media_sdp = session.relay_early_media_sdp;
        let mut base = B2bSession::new(context, dialog, LegRole::ALeg);
        base.sip_relay_only = relay_only;

        Self {
            base,
            invite_req: None,
            callee_status: CalleeStatus::None,
            relay_early_media_sdp,
        }
    }

    pub fn base(&self) -> &B2bSession {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut B2bSession {
        &mut self.base
    }

    pub fn callee_status(&self) -> CalleeStatus {
        self.callee_status
    }

    /// The caller's initial INVITE.
    pub fn invite_request(&self) -> Option<&SipRequest> {
        self.invite_req.as_ref()
    }

    pub async fn process(&mut self, event: LegEvent) -> Result<()> {
        match event {
            LegEvent::SipRequest(request) => self.on_sip_request(request).await,
            LegEvent::SipReply(reply) => self.base.on_sip_reply(reply).await,
            LegEvent::B2b(event) => self.on_b2b_event(event).await,
            LegEvent::ConnectCallee(target) => self.connect_callee(target),
            LegEvent::SessionTimeout => {
                debug!(local_tag = %self.base.local_tag(), "session timer expired");
                self.terminate_other_leg();
                self.base.terminate_leg().await;
                Ok(())
            }
            LegEvent::Refresh => {
                self.base.refresh().await;
                Ok(())
            }
        }
    }

    async fn on_sip_request(&mut self, request: SipRequest) -> Result<()> {
        if request.method == Method::Invite && self.invite_req.is_none() {
            debug!(local_tag = %self.base.local_tag(), cseq = request.cseq, "storing initial INVITE");
            self.invite_req = Some(request.clone());
        }
        self.base.on_sip_request(request).await
    }

    /// Connects the caller to a new callee using the stored initial INVITE.
    pub fn connect_callee(&mut self, target: CalleeTarget) -> Result<()> {
        if self.callee_status != CalleeStatus::None {
            self.terminate_other_leg();
        }

        let invite = self
            .invite_req
            .clone()
            .ok_or_else(|| Error::dialog("no initial INVITE to connect a callee with"))?;

        if target.relayed_invite {
            self.base.recvd_req.insert(invite.clone());
            self.base.sip_relay_only = true;
        }

        let mut body = invite.body.clone();
        if !self.base.body_mode.is_transparent() {
            self.base.filter_body(&mut body);
        }

        info!(
            local_tag = %self.base.local_tag(),
            remote_party = %target.remote_party,
            remote_uri = %target.remote_uri,
            relayed_invite = target.relayed_invite,
            "connecting callee"
        );
        let event = B2bEvent::ConnectLeg(ConnectLeg {
            remote_party: target.remote_party,
            remote_uri: target.remote_uri,
            body: body.clone(),
            headers: invite.headers.clone(),
            relayed_invite: target.relayed_invite,
            r_cseq: invite.cseq,
        });
        self.base.relay_or_warn(event);
        self.callee_status = CalleeStatus::AwaitingFirstReply;
        Ok(())
    }

    async fn on_b2b_event(&mut self, event: B2bEvent) -> Result<()> {
        if let B2bEvent::SipReply { reply, .. } = &event {
            if self.base.other_id() != Some(reply.local_tag.as_str()) {
                debug!(
                    local_tag = %self.base.local_tag(),
                    from = %reply.local_tag,
                    "reply from other dialog ignored"
                );
                return Ok(());
            }

            let answers_invite = self
                .invite_req
                .as_ref()
                .is_some_and(|invite| invite.cseq == reply.cseq);
            if answers_invite
                && matches!(
                    self.callee_status,
                    CalleeStatus::AwaitingFirstReply | CalleeStatus::Ringing
                )
            {
                self.on_callee_invite_reply(reply).await;
                if reply.code >= 300 {
                    self.base.set_stopped();
                }
            }
        }

        self.base.on_b2b_event(event).await
    }

    async fn on_callee_invite_reply(&mut self, reply: &SipReply) {
        debug!(
            local_tag = %self.base.local_tag(),
            code = reply.code,
            status = ?self.callee_status,
            "callee answered initial INVITE"
        );

        if reply.code < 200 {
            if !self.base.sip_relay_only
                && self.relay_early_media_sdp
                && (180..=183).contains(&reply.code)
                && !reply.body.is_empty()
                && let Err(err) = self.reinvite_caller(reply).await
            {
                error!(
                    local_tag = %self.base.local_tag(),
                    error = %err,
                    "re-INVITE of caller for early media failed, stopping both legs"
                );
                self.terminate_other_leg();
                self.base.terminate_leg().await;
            }
            self.callee_status = CalleeStatus::Ringing;
        } else if reply.code < 300 {
            self.callee_status = CalleeStatus::Connected;
            if !self.base.sip_relay_only {
                self.base.sip_relay_only = true;
                if let Err(err) = self.reinvite_caller(reply).await {
                    error!(
                        local_tag = %self.base.local_tag(),
                        error = %err,
                        "re-INVITE of caller failed, stopping both legs"
                    );
                    self.terminate_other_leg();
                    self.base.terminate_leg().await;
                }
            }
        } else {
            self.terminate_other_leg();
        }
    }

    async fn reinvite_caller(&mut self, reply: &SipReply) -> Result<()> {
        let body = self.base.outbound_body(&reply.body, Method::Invite);
        self.base
            .dialog
            .send_request(Method::Invite, &body, &Headers::default())
            .await?;
        Ok(())
    }

    pub fn terminate_other_leg(&mut self) {
        self.base.terminate_other_leg();
        self.callee_status = CalleeStatus::None;
    }
}

/// Creates the callee leg for `caller`, links relay streams and registers it.
pub(super) fn create_callee_session(caller: &mut B2bSession) -> Result<()> {
    let registry = caller.context.registry.clone();
    let other_id = registry.new_id();
    let setup = DialogSetup {
        local_tag: other_id.clone(),
        call_id: registry.new_id(),
        local_party: caller.dialog.remote_party().to_string(),
        remote_party: caller.dialog.local_party().to_string(),
        remote_uri: caller.dialog.local_uri().to_string(),
    };

    let dialog = caller.context.dialogs.create_dialog(setup);
    let mut callee = CalleeSession::new(
        caller.context.clone(),
        dialog,
        caller.local_tag().to_string(),
        caller.body_mode.clone(),
    );

    if caller.rtp_relay_enabled {
        callee.base.rtp_relay_enabled = true;
        caller
            .relay_streams
            .link_with(&mut callee.base.relay_streams)?;
    } else {
        callee.base.rtp_relay_enabled = false;
    }

    registry.add_session(Leg::Callee(callee))?;
    info!(local_tag = %caller.local_tag(), callee = %other_id, "callee session created");
    caller.other_id = Some(other_id);
    Ok(())
}
