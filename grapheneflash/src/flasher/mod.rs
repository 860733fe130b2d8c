//! Flash orchestration: states, events and the state machine.

pub mod engine;
pub mod observer;
pub mod state;

// Re-export common types
pub use engine::{FlashOptions, FlashRequest, FlashStateMachine, FlashTimeouts};
pub use observer::{ChannelObserver, FlashEvent, FlashObserver, LogLevel, NullObserver};
pub use state::{FlashOutcome, FlashProgress, FlashState};
