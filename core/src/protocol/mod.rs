//! Device session wire protocol
//!
//! - `frame`: text frame codec (command, ordered headers, NUL-terminated body)
//! - `payload`: JSON bodies exchanged with the backend

pub mod frame;
pub mod payload;

pub use frame::{is_heartbeat, Frame, FrameCommand, FrameError, FRAME_TERMINATOR};
pub use payload::{
    command_destination, CommandPayload, DeviceRegistration, DeviceStatus, DeviceStatusUpdate,
    PhotoDto, REGISTER_DESTINATION, STATUS_DESTINATION,
};
