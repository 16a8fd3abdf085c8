//! Engine object layouts consumed by the decoders.

pub mod types;

/// `typeID` of bindings that drive a transform.
pub const TRANSFORM_TYPE_ID: i32 = 4;
