#![doc = include_str!("../README.md")]

pub mod frames;

pub use frames::{
    decode, frame_len, CommandFrame, Frame, FrameHeader, FrameType, MalformedFrame, StateFrame,
};

/// Leading bytes of every frame, `"HIL1"` in ASCII
pub const MAGIC: u32 = 0x48494C31;

/// Wire format revision carried in every frame header
pub const VERSION: u8 = 1;

/// The TCP port on which the plant server listens for a controller client by default
pub const PLANT_PORT: u16 = 12369;

/// Largest number of state components that fit in one frame's `u16` byte-length field
pub const MAX_PAYLOAD_VALUES: usize = u16::MAX as usize / 8;

/// Derive To/From with an added "Unknown" variant catch-all for converting
/// from numerical values that do not match a valid variant in order to
/// avoid either panicking or cumbersome error handling.
#[macro_export]
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident($ty:ty) {
            $(
              $( #[$variant_attr:meta] )*
              $variant:ident = $value:expr
            ),+ $(,)?
        }
    ) => {
        #[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
        $( #[$enum_attr] )*
        pub enum $name {
            $(
              $( #[$variant_attr] )*
              $variant
            ),*,
            /// Catch-all for values that do not match a variant
            Unknown($ty)
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant ),*,
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value ),*,
                    $name::Unknown(other) => other
                }
            }
        }
    }
}
