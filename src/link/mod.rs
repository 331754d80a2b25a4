//! Link supervision: wireless association, transport session, and the
//! signal-driven capture sizer.

mod adaptive;
mod transport;
mod wireless;

pub use adaptive::AdaptiveSizer;
pub use transport::{LinkState, TransportSession};
pub use wireless::{HostLink, WirelessInterface, WirelessSupervisor};
