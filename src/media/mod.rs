mod relay;
mod streams;

pub use relay::{UdpRelayTransport, UdpRelayTransportBuilder};
pub use streams::{RelayStream, RelayStreamSet, RelayTransport, StreamHandle};
