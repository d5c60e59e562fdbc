mod b2b;
mod callee;
mod caller;
mod context;
mod description;
mod event;
mod filter;
mod leg;
mod ledger;
mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use b2b::B2bSession;
pub use callee::CalleeSession;
pub use caller::{CallerSession, CalleeStatus};
pub use context::SessionContext;
pub use description::{DescriptionCache, description_hash};
pub use event::{B2bEvent, CalleeTarget, ConnectLeg, LegEvent};
pub use filter::{BodyFilter, BodyMode, FilterDirection, LegRole, MediaKindFilter};
pub use leg::Leg;
pub use ledger::{PendingRequests, RelayedRequests};
pub use registry::{Registry, SessionContainer};
