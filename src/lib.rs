//! Back-to-back SIP session engine.
//! Each call is split into a caller leg and a callee leg that exchange
//! requests and replies as events, with CSeq mapping between the two
//! dialogs, optional SDP filtering and RTP relay address rewriting.

mod net;

pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod sdp;
pub mod session;
pub mod sip;

pub use config::B2bConfig;
pub use engine::{B2bEngine, B2bEngineBuilder};
pub use error::{Error, Result};
pub use session::{
    B2bEvent, B2bSession, CalleeSession, CalleeTarget, CallerSession, Leg, LegEvent, Registry,
    SessionContainer, SessionContext,
};
