//! # vdqm-core
//!
//! Shared runtime plumbing for the VDQM queue manager: async socket
//! helpers, the length-prefixed frame codec with the commit/rollback
//! handshake, and the dedication expression compiler and matcher.

pub mod dedication;
pub mod framing;
pub mod net;

pub use dedication::{AccountDirectory, DedicationExpression, MountAttributes};
pub use framing::Connection;
