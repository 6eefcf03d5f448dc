//! Capture API for the UI layer
//!
//! Thin, synchronous helpers over a [`crate::capture::CaptureHandle`] that
//! produce what the status screen displays.

pub mod capture_api;

pub use capture_api::{capture_status, format_bytes, local_ip_address, CaptureStatus};
