//! A CellSync storage cell: chunk persistence, heartbeat failure detection,
//! self-healing replication and Guard-driven isolation of corrupt peers.

pub mod cell;
pub mod config;
pub mod detector;
pub mod error;
pub mod guard;
pub mod isolation;
pub mod role;
pub mod store;
pub mod transport;

pub use cell::{spawn, spawn_with_transport, CellHandle, CellIdentity, CellSnapshot, CellState, Outbound};
pub use config::{load_config, CellConfig, MAX_DATAGRAM};
pub use error::{NodeError, StoreError, TransportError};
pub use role::Role;
pub use store::ChunkStore;
pub use transport::UdpTransport;
