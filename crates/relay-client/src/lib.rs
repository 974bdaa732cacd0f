//! Relay Client - async client library for the relay server
//!
//! This crate provides:
//! - `client` - A connection that registers, chats, and moves files
//! - `error` - Client error types
//!
//! The interactive console front end is not part of this crate; it only
//! needs to map user input onto [`Client`] calls.

pub mod client;
pub mod error;

pub use client::Client;
pub use error::{ClientError, Result};
