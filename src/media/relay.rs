use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::config::{BindConfig, MediaConfig};
use crate::error::{Error, Result};
use crate::net::bind_relay_socket;

use super::streams::{RelayTransport, StreamHandle};

/// RTP relay transport on plain UDP sockets.
///
/// Each stream owns one socket from the configured port range. Linking two
/// streams spawns one forwarding task per direction; both tasks share a
/// cancellation token that is fired when either side is released.
#[derive(Debug)]
pub struct UdpRelayTransport {
    interface: Option<String>,
    port_range: RangeInclusive<u16>,
    next_port: Mutex<u16>,
    next_handle: AtomicU64,
    streams: Mutex<HashMap<StreamHandle, Arc<RelaySocket>>>,
}

#[derive(Debug)]
pub struct UdpRelayTransportBuilder {
    config: MediaConfig,
}

impl UdpRelayTransportBuilder {
    pub fn from_config(config: &MediaConfig) -> Result<Self> {
        if config.port_range.min % 2 != 0 {
            return Err(Error::configuration(
                "media port range must start on an even port",
            ));
        }
        if config.port_range.max <= config.port_range.min {
            return Err(Error::configuration(
                "media port range must span at least two ports",
            ));
        }

        Ok(Self {
            config: config.clone(),
        })
    }

    pub fn build(self) -> UdpRelayTransport {
        let port_range = self.config.port_range.min..=self.config.port_range.max;
        let initial_port = *port_range.start();
        UdpRelayTransport {
            interface: self.config.bind.interface,
            port_range,
            next_port: Mutex::new(initial_port),
            next_handle: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
        }
    }
}

#[derive(Debug)]
struct RelaySocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    remote: Arc<RwLock<Option<SocketAddr>>>,
    link: Mutex<Option<CancellationToken>>,
}

impl RelaySocket {
    fn cancel_link(&self) {
        if let Some(token) = lock(&self.link).take() {
            token.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl UdpRelayTransport {
    pub fn active_streams(&self) -> usize {
        lock(&self.streams).len()
    }

    fn lookup(&self, stream: StreamHandle) -> Result<Arc<RelaySocket>> {
        lock(&self.streams)
            .get(&stream)
            .cloned()
            .ok_or_else(|| Error::Media(format!("{stream} is not bound")))
    }

    fn reserve_port(&self) -> u16 {
        let mut next = lock(&self.next_port);
        let start = *self.port_range.start();
        let end = *self.port_range.end();

        if *next < start || *next > end {
            *next = start;
        }

        let candidate = *next;
        let mut next_port = candidate.saturating_add(2);
        if next_port > end {
            next_port = start;
        }
        *next = next_port;
        candidate
    }

    fn attempts(&self) -> usize {
        let span = usize::from(self.port_range.end() - self.port_range.start());
        span / 2 + 1
    }

    fn spawn_directional_loop(
        label: &'static str,
        recv: Arc<RelaySocket>,
        send: Arc<RelaySocket>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!(label, local = %recv.local_addr, "relay loop cancelled");
                        break;
                    }
                    result = recv.socket.recv_from(&mut buf) => {
                        let (len, src) = match result {
                            Ok(res) => res,
                            Err(err) => {
                                tracing::warn!(label, error = %err, "relay recv error");
                                continue;
                            }
                        };

                        let destination = send
                            .remote
                            .read()
                            .map(|guard| *guard)
                            .unwrap_or_else(|poisoned| *poisoned.into_inner());
                        let Some(destination) = destination else {
                            tracing::trace!(label, %src, "destination not known yet");
                            continue;
                        };

                        if let Err(err) = send.socket.send_to(&buf[..len], destination).await {
                            tracing::debug!(label, %destination, error = %err, "failed to forward media packet");
                        }
                    }
                }
            }
        });
    }
}

impl RelayTransport for UdpRelayTransport {
    fn bind(&self, local: IpAddr) -> Result<StreamHandle> {
        let bind = BindConfig {
            address: local,
            interface: self.interface.clone(),
        };

        let mut last_err = None;
        for _ in 0..self.attempts() {
            let port = self.reserve_port();
            match bind_relay_socket(&bind, port) {
                Ok(socket) => {
                    let local_addr = socket.local_addr()?;
                    let handle = StreamHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
                    let relay = RelaySocket {
                        socket: Arc::new(socket),
                        local_addr,
                        remote: Arc::new(RwLock::new(None)),
                        link: Mutex::new(None),
                    };
                    lock(&self.streams).insert(handle, Arc::new(relay));
                    tracing::debug!(%handle, %local_addr, "relay socket bound");
                    return Ok(handle);
                }
                Err(err) => {
                    tracing::trace!(port, error = %err, "relay port unavailable");
                    last_err = Some(err);
                }
            }
        }

        Err(Error::Media(format!(
            "no free relay port in {}-{}: {}",
            self.port_range.start(),
            self.port_range.end(),
            last_err
                .map(|err| err.to_string())
                .unwrap_or_else(|| "empty range".into())
        )))
    }

    fn local_port(&self, stream: StreamHandle) -> Result<u16> {
        Ok(self.lookup(stream)?.local_addr.port())
    }

    fn set_remote(&self, stream: StreamHandle, remote: SocketAddr) -> Result<()> {
        let relay = self.lookup(stream)?;
        let mut guard = relay
            .remote
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.replace(remote);
        Ok(())
    }

    fn link(&self, a: StreamHandle, b: StreamHandle) -> Result<()> {
        let first = self.lookup(a)?;
        let second = self.lookup(b)?;
        first.cancel_link();
        second.cancel_link();

        let token = CancellationToken::new();
        lock(&first.link).replace(token.clone());
        lock(&second.link).replace(token.clone());

        Self::spawn_directional_loop("a->b", first.clone(), second.clone(), token.clone());
        Self::spawn_directional_loop("b->a", second, first, token);
        tracing::debug!(%a, %b, "relay streams linked");
        Ok(())
    }

    fn release(&self, stream: StreamHandle) {
        if let Some(relay) = lock(&self.streams).remove(&stream) {
            relay.cancel_link();
            tracing::debug!(%stream, local = %relay.local_addr, "relay socket released");
        }
    }
}
