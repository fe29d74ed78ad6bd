//! Request/response types and their wire encoding.
//!
//! # Data Flow
//! ```text
//! CheckRequest (caller-facing, AttributeValue trees)
//!     → wire.rs (WireCheckRequest, Struct/Value messages)
//!     → frame.rs ([u32 len][JSON envelope] on the socket)
//!     → server
//!     → frame.rs → wire.rs → CheckResponse
//! ```
//!
//! # Design Decisions
//! - Attribute trees are a closed enum, so wire conversion is exhaustive
//! - Effects travel as integer codes; unknown codes decode as unspecified
//! - Frames carry their own call id so one socket multiplexes many calls

pub mod frame;
pub mod types;
pub mod value;
pub mod wire;

pub use frame::{read_frame, write_frame, Frame, FrameBody, Metadata, MAX_FRAME_SIZE};
pub use types::{
    ActionResult, CheckRequest, CheckResponse, Effect, Principal, Resource, ResponseMetadata,
};
pub use value::{AttributeValue, Attributes};
