//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check and booking contract endpoints
//! - `booking` - Voice booking WebSocket

pub mod api;
pub mod booking;

// Re-export commonly used handlers for convenient access
pub use booking::booking_handler;
