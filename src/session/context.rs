use std::fmt;
use std::sync::Arc;

use crate::config::B2bConfig;
use crate::media::{RelayStreamSet, RelayTransport};
use crate::sip::DialogFactory;

use super::registry::Registry;

/// Shared collaborators handed to every leg.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<B2bConfig>,
    pub registry: Arc<dyn Registry>,
    pub relay: Arc<dyn RelayTransport>,
    pub dialogs: Arc<dyn DialogFactory>,
}

impl SessionContext {
    /// Empty stream set sized and addressed from the media config.
    pub fn new_relay_streams(&self) -> RelayStreamSet {
        let media = &self.config.media;
        RelayStreamSet::new(
            self.relay.clone(),
            media.bind.address,
            media.advertised_ip(),
            media.max_relay_streams,
        )
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
