//! Data models for the capture engine
//!
//! These types cross the boundary to the UI layer and are serde-serializable.

pub mod dump_mode;
pub mod event;
pub mod packet;
pub mod stats;

pub use dump_mode::*;
pub use event::*;
pub use packet::*;
pub use stats::*;
