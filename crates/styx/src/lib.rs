#![forbid(unsafe_code)]
//! Synthetic file trees served over 9P2000/9P2000.u.
//!
//! This crate lets an application expose an in-memory tree of synthetic
//! files and directories to remote clients over the 9P protocol. Files are
//! built with [`file::File::add`] and given behavior through a
//! [`file::FileOps`] record, any subset of read, write, create, remove,
//! stat and wstat; whatever a file's record does not implement, the server
//! refuses with "permission denied". The tree is handed to
//! [`file::FileSrv`], which services the full classic message set (attach,
//! walk, open, create, read, write, clunk, remove, stat, wstat) over TCP or
//! Unix sockets.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use styx::{dm, file::{File, FileSrv, NoOps}, srv::srv_async, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let root = File::add(None, "/", None, None, dm::DIR | 0o755, Arc::new(NoOps))?;
//!     File::add(Some(&root), "README", None, None, 0o444, Arc::new(NoOps))?;
//!
//!     srv_async(FileSrv::new(root), "tcp!0.0.0.0!564").await
//! }
//! ```
//!
//! Per-file behavior comes from implementing [`file::FileOps`]; see the
//! `memfs` crate in this workspace for a writable RAM filesystem built this
//! way.
//!
//! # Protocol
//!
//! 9P2000, with the 9P2000.u extension negotiated per connection. The
//! `.u` flag governs whether stat records carry the extension fields and
//! whether errors carry an errno; a connection negotiates it once in
//! `Tversion` and the server tracks it in [`srv::Conn`].
//!
//! A small client side lives in [`clnt`]: version/attach, walk, clunk and
//! the remove-by-path primitive.
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod clnt;
pub mod error;
pub mod fcall;
pub mod file;
pub mod serialize;
pub mod srv;
pub mod user;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
