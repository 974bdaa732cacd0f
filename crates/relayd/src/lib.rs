//! Relay Daemon - chat broadcast and shared file directory server
//!
//! This crate provides the core infrastructure for the relay daemon:
//! - `config` - Layered server settings (flags, environment, TOML file)
//! - `registry` - Session registry actor tracking live sessions and handles
//! - `server` - TCP listener and per-connection command dispatch
//! - `outbound` - Per-session outbound queue and its single writer task
//! - `storage` - The shared server directory
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        relayd daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │   RelayServer   │────▶│     RegistryActor           │   │
//! │  │  (TcpListener)  │     │  (membership + handles)     │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ connections                 │ chat lines        │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│────▶│   SessionLink → writer      │   │
//! │  │  (per client)   │     │   (one per client)          │   │
//! │  └────────┬────────┘     └─────────────────────────────┘   │
//! │           │ /store /get /dir                                │
//! │           ▼                                                 │
//! │  ┌─────────────────┐                                        │
//! │  │    FileStore    │                                        │
//! │  └─────────────────┘                                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod outbound;
pub mod registry;
pub mod server;
pub mod storage;
