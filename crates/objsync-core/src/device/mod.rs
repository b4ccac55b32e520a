//! Device state machine and state codecs

mod codec;
mod state_machine;

pub use codec::{CborCodec, ConfiguredCodec, JsonCodec, StateCodec};
pub use state_machine::DeviceStateMachine;
