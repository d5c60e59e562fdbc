use std::sync::Arc;

use tracing::{debug, info};

use crate::config::B2bConfig;
use crate::error::{Error, Result};
use crate::media::{RelayTransport, UdpRelayTransportBuilder};
use crate::session::{
    B2bEvent, CallerSession, Leg, LegEvent, Registry, SessionContainer, SessionContext,
};
use crate::sip::{Dialog, DialogFactory};

pub struct B2bEngineBuilder {
    config: B2bConfig,
    dialogs: Arc<dyn DialogFactory>,
    relay: Option<Arc<dyn RelayTransport>>,
    registry: Option<Arc<dyn Registry>>,
}

impl B2bEngineBuilder {
    pub fn new(config: B2bConfig, dialogs: Arc<dyn DialogFactory>) -> Self {
        Self {
            config,
            dialogs,
            relay: None,
            registry: None,
        }
    }

    /// Replaces the UDP relay built from the media config.
    pub fn with_relay_transport(mut self, relay: Arc<dyn RelayTransport>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Replaces the default [`SessionContainer`].
    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<B2bEngine> {
        let udp = UdpRelayTransportBuilder::from_config(&self.config.media)?;
        validate_streams(&self.config)?;

        let relay: Arc<dyn RelayTransport> = match self.relay {
            Some(relay) => relay,
            None => Arc::new(udp.build()),
        };
        let registry: Arc<dyn Registry> = match self.registry {
            Some(registry) => registry,
            None => Arc::new(SessionContainer::new()),
        };

        let context = SessionContext {
            config: Arc::new(self.config),
            registry,
            relay,
            dialogs: self.dialogs,
        };
        Ok(B2bEngine { context })
    }
}

/// Port range shape is checked by the relay builder; this covers stream counts.
fn validate_streams(config: &B2bConfig) -> Result<()> {
    let media = &config.media;
    if media.max_relay_streams == 0 {
        return Err(Error::configuration("max_relay_streams must be positive"));
    }
    let needed = media.max_relay_streams * 2;
    if media.port_range.rtp_slots() < needed {
        return Err(Error::configuration(format!(
            "media port range {}-{} holds {} streams, {} needed for one call",
            media.port_range.min,
            media.port_range.max,
            media.port_range.rtp_slots(),
            needed
        )));
    }
    Ok(())
}

/// Entry point for the dialog layer: starts caller legs and routes events.
#[derive(Debug, Clone)]
pub struct B2bEngine {
    context: SessionContext,
}

impl B2bEngine {
    pub fn builder(config: B2bConfig, dialogs: Arc<dyn DialogFactory>) -> B2bEngineBuilder {
        B2bEngineBuilder::new(config, dialogs)
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn config(&self) -> &B2bConfig {
        &self.context.config
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.context.registry
    }

    /// Registers a caller leg for an incoming dialog and returns its tag.
    ///
    /// With the default registry this spawns a task and must be called from
    /// within a tokio runtime.
    pub fn start_caller(&self, dialog: Box<dyn Dialog>) -> Result<String> {
        let tag = dialog.local_tag().to_string();
        let caller = CallerSession::new(self.context.clone(), dialog);
        self.context.registry.add_session(Leg::Caller(caller))?;
        info!(local_tag = %tag, "caller session started");
        Ok(tag)
    }

    pub fn post(&self, target: &str, event: LegEvent) -> Result<()> {
        self.context.registry.post_event(target, event)
    }

    /// Terminates every running leg.
    pub fn shutdown(&self) {
        let sessions = self.context.registry.sessions();
        info!(sessions = sessions.len(), "terminating all sessions");
        for tag in sessions {
            if let Err(err) = self.post(&tag, LegEvent::B2b(B2bEvent::TerminateLeg)) {
                debug!(local_tag = %tag, error = %err, "session already gone");
            }
        }
    }
}
