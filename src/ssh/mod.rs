//! C3 EmbeddedSSH and the shared outbound SSH client handler used by
//! ReverseTunnel, ForwardTunnel, and RelayControl (spec.md §4.2, §9 open
//! question (b)).

pub mod client_handler;
pub(crate) mod io;
pub mod server;

pub use client_handler::ClientHandler;
pub use server::{ConnectHook, DisconnectHook, EmbeddedSsh};
