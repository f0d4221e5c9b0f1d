// src/core/mod.rs

//! The central module containing the core logic and data structures of the room runtime.

pub mod crdt;
pub mod errors;
pub mod events;
pub mod flush;
pub mod history;
pub mod ids;
pub mod ledger;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod storage;

pub use errors::RoomError;
pub use protocol::Op;
pub use room::Room;
