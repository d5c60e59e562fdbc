use std::fmt;
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::sdp::SessionDescription;
use crate::sip::MessageBody;

/// Which side of the call a leg faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegRole {
    /// Toward the caller.
    ALeg,
    /// Toward the callee.
    BLeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDirection {
    CallerToCallee,
    CalleeToCaller,
}

impl From<LegRole> for FilterDirection {
    fn from(role: LegRole) -> Self {
        match role {
            LegRole::ALeg => FilterDirection::CallerToCallee,
            LegRole::BLeg => FilterDirection::CalleeToCaller,
        }
    }
}

/// Hook for editing session descriptions relayed between legs.
pub trait BodyFilter: Send + Sync + 'static {
    fn filter(&self, sdp: &mut SessionDescription, direction: FilterDirection) -> Result<()>;
}

/// Disables media lines of the listed kinds by setting their port to 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaKindFilter {
    disabled: Vec<String>,
}

impl MediaKindFilter {
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            disabled: kinds.into_iter().map(Into::into).collect(),
        }
    }

    fn is_disabled(&self, kind: &str) -> bool {
        self.disabled
            .iter()
            .any(|disabled| disabled.eq_ignore_ascii_case(kind))
    }
}

impl BodyFilter for MediaKindFilter {
    fn filter(&self, sdp: &mut SessionDescription, _direction: FilterDirection) -> Result<()> {
        for media in sdp.media.iter_mut() {
            if self.is_disabled(&media.kind) {
                media.port = 0;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub enum BodyMode {
    #[default]
    Transparent,
    SdpFilter(MediaKindFilter),
    Custom(Arc<dyn BodyFilter>),
}

impl fmt::Debug for BodyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyMode::Transparent => f.write_str("Transparent"),
            BodyMode::SdpFilter(filter) => f.debug_tuple("SdpFilter").field(filter).finish(),
            BodyMode::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl BodyMode {
    pub fn from_config(config: &SessionConfig) -> Self {
        match config.body_mode {
            crate::config::BodyModeConfig::Transparent => BodyMode::Transparent,
            crate::config::BodyModeConfig::SdpFilter => {
                BodyMode::SdpFilter(MediaKindFilter::new(config.filtered_media.iter().cloned()))
            }
        }
    }

    pub fn is_transparent(&self) -> bool {
        matches!(self, BodyMode::Transparent)
    }

    /// Filters an SDP body in place. Bodies that fail to parse are left as
    /// they are and the error is returned.
    pub fn apply(&self, body: &mut MessageBody, direction: FilterDirection) -> Result<()> {
        let filter: &dyn BodyFilter = match self {
            BodyMode::Transparent => return Ok(()),
            BodyMode::SdpFilter(filter) => filter,
            BodyMode::Custom(filter) => filter.as_ref(),
        };
        if !body.is_sdp() {
            return Ok(());
        }

        let mut sdp = SessionDescription::parse(&body.data)?;
        filter.filter(&mut sdp, direction)?;
        body.data = sdp.to_string();
        Ok(())
    }
}
