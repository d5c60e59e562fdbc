use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, RewriteError};
use crate::sdp::SessionDescription;
use crate::sip::MessageBody;

/// Handle of a stream owned by a [`RelayTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relay#{}", self.0)
    }
}

/// Socket layer behind the relay streams. Streams live in the transport and
/// legs only hold handles, so a released stream can never be forwarded into.
pub trait RelayTransport: Send + Sync + 'static {
    fn bind(&self, local: IpAddr) -> Result<StreamHandle>;

    fn local_port(&self, stream: StreamHandle) -> Result<u16>;

    fn set_remote(&self, stream: StreamHandle, remote: SocketAddr) -> Result<()>;

    /// Packets received on `a` go out through `b` to its remote and vice versa.
    fn link(&self, a: StreamHandle, b: StreamHandle) -> Result<()>;

    fn release(&self, stream: StreamHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStream {
    pub handle: StreamHandle,
    pub local_port: u16,
}

/// Per media line relay bindings of one leg.
pub struct RelayStreamSet {
    transport: Arc<dyn RelayTransport>,
    local_ip: IpAddr,
    advertised_ip: IpAddr,
    slots: Vec<Option<RelayStream>>,
    remotes: Vec<Option<SocketAddr>>,
    excess_lines: usize,
}

impl fmt::Debug for RelayStreamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayStreamSet")
            .field("local_ip", &self.local_ip)
            .field("advertised_ip", &self.advertised_ip)
            .field("slots", &self.slots)
            .field("remotes", &self.remotes)
            .field("excess_lines", &self.excess_lines)
            .finish()
    }
}

impl RelayStreamSet {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        local_ip: IpAddr,
        advertised_ip: IpAddr,
        capacity: usize,
    ) -> Self {
        Self {
            transport,
            local_ip,
            advertised_ip,
            slots: vec![None; capacity],
            remotes: vec![None; capacity],
            excess_lines: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn stream(&self, index: usize) -> Option<&RelayStream> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn local_port(&self, index: usize) -> Option<u16> {
        self.stream(index).map(|stream| stream.local_port)
    }

    pub fn remote(&self, index: usize) -> Option<SocketAddr> {
        self.remotes.get(index).copied().flatten()
    }

    /// Media lines seen beyond capacity since the set was created.
    pub fn excess_lines(&self) -> usize {
        self.excess_lines
    }

    /// Binds every free slot. Remotes learned before binding are applied.
    pub fn bind_all(&mut self) -> Result<()> {
        for index in 0..self.slots.len() {
            if self.slots[index].is_some() {
                continue;
            }
            let handle = self.transport.bind(self.local_ip)?;
            let local_port = match self.transport.local_port(handle) {
                Ok(port) => port,
                Err(err) => {
                    self.transport.release(handle);
                    return Err(err);
                }
            };
            if let Some(remote) = self.remotes[index] {
                self.transport.set_remote(handle, remote)?;
            }
            debug!(index, %handle, local_port, "relay stream bound");
            self.slots[index] = Some(RelayStream { handle, local_port });
        }
        Ok(())
    }

    /// Binds both sets and cross-links them slot by slot.
    pub fn link_with(&mut self, other: &mut RelayStreamSet) -> Result<()> {
        self.bind_all()?;
        other.bind_all()?;
        for (own, peer) in self.slots.iter().zip(other.slots.iter()) {
            if let (Some(own), Some(peer)) = (own, peer) {
                self.transport.link(own.handle, peer.handle)?;
            }
        }
        Ok(())
    }

    /// Learns remote endpoints from a parsed description, in media line order.
    pub fn learn_remotes(&mut self, sdp: &SessionDescription) {
        let capacity = self.capacity();
        if sdp.media.len() > capacity {
            let excess = sdp.media.len() - capacity;
            self.excess_lines += excess;
            warn!(
                media_lines = sdp.media.len(),
                capacity, excess, "more media lines than relay streams; excess lines not relayed"
            );
        }

        for index in 0..sdp.media.len().min(capacity) {
            let Some(remote) = sdp.media_endpoint(index) else {
                debug!(index, "media line without usable connection address");
                continue;
            };
            if remote.port() == 0 {
                debug!(index, "media line disabled, keeping previous remote");
                continue;
            }

            debug!(index, %remote, "initializing relay stream remote");
            self.remotes[index] = Some(remote);
            if let Some(stream) = self.slots[index] {
                if let Err(err) = self.transport.set_remote(stream.handle, remote) {
                    warn!(index, %remote, error = %err, "failed to set relay stream remote");
                }
            }
        }
    }

    /// Parses `body` and learns its endpoints; unusable bodies are skipped.
    pub fn learn_from_body(&mut self, body: &MessageBody) {
        if !body.is_sdp() {
            return;
        }
        match SessionDescription::parse(&body.data) {
            Ok(sdp) => self.learn_remotes(&sdp),
            Err(err) => debug!(error = %err, "SDP parsing failed, relay streams unchanged"),
        }
    }

    /// Puts the advertised address and the relay ports into `body`.
    ///
    /// Lines beyond capacity keep their original port. Disabled lines (port 0)
    /// stay disabled.
    pub fn rewrite(&self, body: &MessageBody) -> Result<String, RewriteError> {
        if body.is_empty() {
            return Err(RewriteError::EmptyBody);
        }
        if !body.is_sdp() {
            return Err(RewriteError::NotSdp(body.content_type.clone()));
        }

        let mut sdp = SessionDescription::parse(&body.data)?;
        if let Some(conn) = sdp.connection_mut() {
            conn.set_ip(self.advertised_ip);
        }

        let capacity = self.capacity();
        let mut replaced_ports = Vec::new();
        for (index, media) in sdp.media.iter_mut().enumerate() {
            if index >= capacity {
                warn!(
                    index,
                    capacity, "media line beyond relay capacity passed through unchanged"
                );
                break;
            }
            for conn in media.connections_mut() {
                conn.set_ip(self.advertised_ip);
            }
            if media.port == 0 {
                continue;
            }
            let port = self
                .local_port(index)
                .ok_or(RewriteError::StreamUnbound(index))?;
            media.port = port;
            replaced_ports.push(port.to_string());
        }

        debug!(
            address = %self.advertised_ip,
            ports = %replaced_ports.join("/"),
            "replaced connection address in SDP"
        );
        Ok(sdp.to_string())
    }

    /// Releases every bound stream. Safe to call more than once.
    pub fn release(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(stream) = slot.take() {
                debug!(index, handle = %stream.handle, "releasing relay stream");
                self.transport.release(stream.handle);
            }
        }
    }
}

impl Drop for RelayStreamSet {
    fn drop(&mut self) {
        self.release();
    }
}
