//! # Capture Core

//! Packet capture and export engine for a VPN-based traffic capture app.
//! Built with Rust so the per-packet path stays fast and never stalls.
//!
//! ## Features
//!
//! - Capture session lifecycle (ready / running) with live statistics
//! - Export to a pcap file, a pcap-over-HTTP stream or a UDP collector
//! - Optional TLS decryption via certificates forged from a local CA
//! - Fire-and-forget notifications for the UI layer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Host app (VPN service + UI)                 │
//! ├─────────────────────────────────────────────────────────┤
//! │                 Capture Core (Rust)                      │
//! │  ┌─────────┐  ┌──────────┐  ┌────────┐  ┌───────────┐   │
//! │  │ Capture │  │   TLS    │  │ Stats  │  │   Dump    │   │
//! │  │ Session │──│ Decryptor│──│        │──│  Backend  │   │
//! │  └─────────┘  └──────────┘  └────────┘  └───────────┘   │
//! │        │                                                 │
//! │        └──── Notifier ──▶ observers (stats, state)       │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod capture;
pub mod config;
pub mod dump;
pub mod error;
pub mod logging;
pub mod models;
pub mod platform;
pub mod tls;

pub use capture::{CaptureHandle, CaptureSession, IngestVerdict};
pub use config::{CaptureConfig, TlsDecryptionConfig};
pub use error::CaptureError;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
