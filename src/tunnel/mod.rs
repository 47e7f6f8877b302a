//! C4 ReverseTunnel and C5 ForwardTunnel (spec.md §4.3, §4.4).

pub(crate) mod common;
pub mod forward;
pub mod reverse;

pub use forward::ForwardTunnel;
pub use reverse::ReverseTunnel;
