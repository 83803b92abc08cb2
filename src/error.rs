//! Host-level failure modes.
//!
//! These never reach the guest: a bad image path, an oversized DTB, or
//! an allocation failure abort the process before the hart takes its
//! first step. Guest-visible faults are represented separately by
//! [`crate::trap::Trap`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("could not open image \"{path}\": {source}")]
    ImageOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("image \"{path}\" ({size} bytes) does not fit in {ram} bytes of RAM")]
    ImageTooLarge {
        path: String,
        size: u64,
        ram: u32,
    },

    #[error("could not open device tree blob \"{path}\": {source}")]
    DtbOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("device tree blob \"{path}\" ({size} bytes) does not fit alongside a {ram}-byte image")]
    DtbTooLarge {
        path: String,
        size: u64,
        ram: u32,
    },

    #[error("invalid RAM size \"{0}\"")]
    InvalidRamSize(String),
}
