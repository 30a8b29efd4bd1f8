//! Account discovery
//!
//! - `record` - Discovery Record and Address Record, the state a run leaves behind
//! - `engine` - the state machine driving runs per device identity and coin

pub mod engine;
pub mod record;

pub use engine::{AccountSource, DiscoveryEngine, DiscoveryEvent};
pub use record::{
    AddressRecord, DiscoveryFault, DiscoveryRecord, DiscoveryStatus, FaultKind,
};
