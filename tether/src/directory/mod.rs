//! Addressable placement: leases, the directory and routing strategies.

mod lease;
mod placement;
mod routing;
mod store;

pub use lease::AddressableLease;
pub use placement::Placement;
pub use routing::{RandomRouting, RoutingStrategy};
pub use store::{AddressableDirectory, InMemoryAddressableDirectory};
