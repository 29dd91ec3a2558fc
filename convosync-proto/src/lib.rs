//! Shared data model and wire protocol for `convosync`.

pub mod codec;
pub mod conversation;
pub mod message;
pub mod notification;
pub mod presence;
pub mod wire;
