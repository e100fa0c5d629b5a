//! Persistence gateway contract and implementations
//!
//! - [`PersistenceGateway`]: the async contract the engine writes to and queries
//! - [`InMemoryGateway`]: concurrent in-process store
//! - [`SledGateway`]: durable store on Sled
//! - [`series`]: metric series derived from rollups or raw events

pub mod gateway;
pub mod memory;
pub mod series;
pub mod sled_gateway;

pub use gateway::{PersistenceGateway, RetentionTarget, SeriesFilter};
pub use memory::{InMemoryGateway, MemoryGatewayStats};
pub use sled_gateway::{SledGateway, SledGatewayConfig};
