use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Method};

use crate::sdp::is_sdp;

/// Body of a SIP message together with its content type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBody {
    pub content_type: String,
    pub data: String,
}

impl MessageBody {
    pub fn new(content_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_sdp(&self) -> bool {
        !self.data.is_empty() && is_sdp(&self.content_type)
    }

    pub fn with_data(&self, data: String) -> Self {
        Self {
            content_type: self.content_type.clone(),
            data,
        }
    }
}

/// Opaque handle the dialog layer uses to find a server transaction again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionTicket(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct RAck {
    pub rseq: u32,
    pub cseq: u32,
    pub method: Method,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SipRequest {
    pub method: Method,
    pub cseq: u32,
    pub body: MessageBody,
    pub headers: Headers,
    pub ticket: TransactionTicket,
    /// Parsed RAck of a PRACK.
    pub rack: Option<RAck>,
}

impl SipRequest {
    pub fn new(method: Method, cseq: u32) -> Self {
        Self {
            method,
            cseq,
            body: MessageBody::default(),
            headers: Headers::default(),
            ticket: TransactionTicket::default(),
            rack: None,
        }
    }

    pub fn with_body(mut self, body: MessageBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn with_rack(mut self, rack: RAck) -> Self {
        self.rack = Some(rack);
        self
    }

    pub fn is_offer_answer(&self) -> bool {
        is_offer_answer(self.method)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SipReply {
    pub code: u16,
    pub reason: String,
    pub cseq: u32,
    /// Method of the transaction this reply belongs to.
    pub method: Method,
    pub body: MessageBody,
    pub headers: Headers,
    /// RSeq of a reliable provisional response.
    pub rseq: Option<u32>,
    /// Tag of the leg that produced or relayed the reply.
    pub local_tag: String,
}

impl SipReply {
    pub fn new(code: u16, reason: impl Into<String>, cseq: u32, method: Method) -> Self {
        Self {
            code,
            reason: reason.into(),
            cseq,
            method,
            body: MessageBody::default(),
            headers: Headers::default(),
            rseq: None,
            local_tag: String::new(),
        }
    }

    pub fn with_body(mut self, body: MessageBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn with_rseq(mut self, rseq: u32) -> Self {
        self.rseq = Some(rseq);
        self
    }

    pub fn is_provisional(&self) -> bool {
        self.code < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_final(&self) -> bool {
        self.code >= 200
    }
}

/// INVITE and UPDATE carry offer/answer bodies; ACK may carry a delayed answer.
pub fn is_offer_answer(method: Method) -> bool {
    matches!(method, Method::Invite | Method::Update | Method::Ack)
}

/// Reports whether an Allow header lists UPDATE, or None without an Allow header.
pub fn allows_update(headers: &Headers) -> Option<bool> {
    let mut seen = false;
    for header in headers.iter() {
        let value = match header {
            Header::Allow(allow) => allow.value(),
            Header::Other(name, value) if name.eq_ignore_ascii_case("Allow") => value.as_str(),
            _ => continue,
        };
        seen = true;
        if value
            .split(',')
            .any(|method| method.trim().eq_ignore_ascii_case("UPDATE"))
        {
            return Some(true);
        }
    }
    seen.then_some(false)
}
