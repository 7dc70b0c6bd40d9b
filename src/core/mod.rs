pub mod audio;
pub mod booking;
pub mod realtime;

// Re-export commonly used types for convenience
pub use audio::{AudioBridge, AudioBridgeConfig, AudioError, Interruption, SampleEncoding};

pub use booking::{
    BookingEvent, BookingRecord, BookingSnapshot, BookingState, BookingStateMachine, Fulfillment,
    MockFulfillment, Transition, booking_tools,
};

pub use realtime::{
    BaseRealtime, BoxedRealtime, OpenAIRealtime, RealtimeConfig, RealtimeError, RealtimeEvent,
    RealtimeProvider, RealtimeResult, create_realtime_provider, get_supported_realtime_providers,
};
