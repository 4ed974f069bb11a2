//! `GigaVector` Server - binary wire-protocol server for `GigaVector`.
//!
//! An acceptor thread plus a fixed-size worker pool (spec.md §4.14) expose a
//! single [`gigavector_core`] vector collection over the framed binary
//! protocol defined in spec.md §4.13. Unlike the REST surface the teacher
//! crate exposes, this server speaks one connection-oriented TCP protocol
//! and keeps exactly one collection per process.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod handlers;
pub mod server;

pub use engine::{Engine, EngineIndexKind};
pub use server::{Server, ServerHandle};
