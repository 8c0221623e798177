//! Wire-level protocol: output patterns and checksum framing

pub mod framing;
pub mod patterns;

pub use framing::{checksum, parse_framed, render_framed, render_plain, FramedLine};
