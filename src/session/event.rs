use rsip::Headers;

use crate::sip::{MessageBody, SipReply, SipRequest};

/// Events exchanged between the two legs of a call.
#[derive(Debug, Clone)]
pub enum B2bEvent {
    SipRequest { request: SipRequest, forward: bool },
    SipReply { reply: SipReply, forward: bool },
    TerminateLeg,
    ConnectLeg(ConnectLeg),
}

impl B2bEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            B2bEvent::SipRequest { .. } => "b2b-request",
            B2bEvent::SipReply { .. } => "b2b-reply",
            B2bEvent::TerminateLeg => "terminate-leg",
            B2bEvent::ConnectLeg(_) => "connect-leg",
        }
    }

    /// Forwarded SIP traffic and connect requests need a callee to land on.
    pub fn needs_callee(&self) -> bool {
        match self {
            B2bEvent::SipRequest { forward, .. } | B2bEvent::SipReply { forward, .. } => *forward,
            B2bEvent::ConnectLeg(_) => true,
            B2bEvent::TerminateLeg => false,
        }
    }
}

/// Asks a freshly created callee leg to send the initial INVITE.
#[derive(Debug, Clone)]
pub struct ConnectLeg {
    pub remote_party: String,
    pub remote_uri: String,
    pub body: MessageBody,
    pub headers: Headers,
    /// The caller's INVITE is relayed rather than answered locally.
    pub relayed_invite: bool,
    /// CSeq of the caller's INVITE.
    pub r_cseq: u32,
}

/// Callee the application wants the caller connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalleeTarget {
    pub remote_party: String,
    pub remote_uri: String,
    pub relayed_invite: bool,
}

/// Everything a leg's postbox accepts.
#[derive(Debug, Clone)]
pub enum LegEvent {
    /// Request received on the leg's own dialog.
    SipRequest(SipRequest),
    /// Reply received on the leg's own dialog.
    SipReply(SipReply),
    /// Event from the other leg.
    B2b(B2bEvent),
    ConnectCallee(CalleeTarget),
    SessionTimeout,
    Refresh,
}

impl LegEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LegEvent::SipRequest(_) => "sip-request",
            LegEvent::SipReply(_) => "sip-reply",
            LegEvent::B2b(event) => event.kind(),
            LegEvent::ConnectCallee(_) => "connect-callee",
            LegEvent::SessionTimeout => "session-timeout",
            LegEvent::Refresh => "refresh",
        }
    }
}
