//! `convosync` — conversation sync engine and multi-tab session lifecycle
//! manager.

pub mod backend;
pub mod config;
pub mod crypto;
pub mod error;
pub mod kv;
pub mod send;
pub mod session;
pub mod store;
pub mod sync;
