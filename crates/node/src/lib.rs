//! Full node: event bus, chasers, sessions, and configuration.

pub mod chaser_check;
pub mod chaser_confirm;
pub mod chaser_header;
pub mod chaser_validate;
pub mod config;
pub mod events;
pub mod node;
pub mod p2p;
pub mod session;

pub use config::{Config, Subcommand};
pub use events::{Chase, ChaseEvent, EventBus, FaultCode};
pub use node::FullNode;
