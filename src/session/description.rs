use tracing::debug;

use crate::sdp::is_sdp;
use crate::sip::MessageBody;

/// Last session description a leg treated as established.
#[derive(Debug, Clone, Default)]
pub struct DescriptionCache {
    content_type: String,
    body: String,
    hash: Option<[u8; 16]>,
}

impl DescriptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.content_type.is_empty() || self.body.is_empty()
    }

    pub fn established(&self) -> Option<MessageBody> {
        if self.is_empty() {
            return None;
        }
        Some(MessageBody::new(self.content_type.clone(), self.body.clone()))
    }

    pub fn save(&mut self, body: &MessageBody) {
        debug!(
            content_type = %body.content_type,
            preview = %preview(&body.data),
            "saving session description"
        );
        self.content_type = body.content_type.clone();
        self.body = body.data.clone();
        self.hash = Some(description_hash(&body.content_type, &body.data));
    }

    /// Stores `body` and returns true when it differs from the cached one.
    pub fn update(&mut self, body: &MessageBody) -> bool {
        let hash = description_hash(&body.content_type, &body.data);
        if self.hash == Some(hash) {
            return false;
        }

        debug!(
            content_type = %body.content_type,
            preview = %preview(&body.data),
            "session description changed"
        );
        self.content_type = body.content_type.clone();
        self.body = body.data.clone();
        self.hash = Some(hash);
        true
    }
}

/// MD5 over the body. For SDP the v= and o= lines are skipped since the origin
/// version may change while the description itself stays the same.
pub fn description_hash(content_type: &str, body: &str) -> [u8; 16] {
    let mut compared = body;
    if is_sdp(content_type) {
        for _ in 0..2 {
            compared = match compared.find('\n') {
                Some(pos) => &compared[pos + 1..],
                None => "",
            };
        }
    }
    md5::compute(compared.as_bytes()).0
}

fn preview(body: &str) -> &str {
    match body.char_indices().nth(50) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
