//! Nightjar: dual-transport peer-to-peer messaging core.
//!
//! Delivers chat over two disjoint networks: a short-range flood-routed
//! mesh (store-and-forward, Bloom-sketch anti-entropy) and a relay
//! overlay reached exclusively through an embedded anonymizing proxy.
//! The core decides which transport carries each message, keeps the mesh
//! convergent after partitions, speaks the binary wire formats, and
//! enforces the fail-closed policy that nothing leaves the device until
//! the proxy is fully bootstrapped.
//!
//! The surrounding application supplies the radio driver
//! ([`mesh::MeshTransport`]), the relay WebSocket client
//! ([`overlay::RelaySink`]), and the identity collaborator; this crate
//! is the routing, sync, and policy core between them.

pub mod bloom;
pub mod config;
pub mod error;
pub mod favorites;
pub mod geohash;
pub mod gossip;
pub mod identity;
pub mod ledger;
pub mod mesh;
pub mod node;
pub mod overlay;
pub mod pow;
pub mod proxy;
pub mod rate_limit;
pub mod router;
pub mod tasks;
pub mod wire;

pub use config::Config;
pub use error::{Error, Result};
pub use favorites::{FavoriteStatusChanged, Favorites};
pub use identity::{OverlayIdentity, PeerId};
pub use node::{AppEvent, Node};
pub use proxy::{ProxyManager, ProxyState};
pub use router::{DeliveryStatus, MessageRouter};
pub use wire::{Fingerprint, Packet};
