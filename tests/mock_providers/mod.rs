//! Mock provider servers for integration tests

// Each test binary uses a different subset of these helpers
#![allow(dead_code)]

pub mod realtime_mock;

pub use realtime_mock::{MockRealtimeServer, MockScript, function_call_turn, spoken_turn};
