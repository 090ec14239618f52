//! Shared networking vocabulary for hopbridge.
//!
//! This library provides:
//! - The boxed stream type every hop hands around
//! - Capability traits (`Dialer`, `ListenConfig`, `CommandDialer`) and the
//!   tagged `Hop` capability set a `Bridger` produces
//! - The hop specifier grammar (`scheme::resolve`)
//! - A peekable stream wrapper that can push bytes back (`UnreadStream`)
//! - Shell-style command splitting for command hops

pub mod capability;
pub mod command;
pub mod scheme;
pub mod stream;
pub mod unread;

pub use capability::{
    BoxedListener, BridgeError, Bridger, CommandDialer, Dialer, Hop, ListenConfig, Listener,
    Negotiated, ProxyHandler,
};
pub use command::{split_command, CommandTemplate};
pub use scheme::{join_host_port, join_scheme_addr, resolve, split_host_port, Endpoint, HopUri};
pub use stream::{AsyncStream, BoxedStream};
pub use unread::UnreadStream;
