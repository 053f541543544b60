//! Arbor Protocol
//!
//! Shared types for communication between the Arbor sync server and its
//! observers. These types are serialized as JSON over WebSocket, one object
//! per message.

pub mod api;
pub mod client;
pub mod server;
pub mod types;

pub use api::{
    ArchiveFeatureRequest, CommandResponse, CreateFeatureRequest, CreateFromBranchRequest,
};
pub use client::ClientMessage;
pub use server::ServerMessage;
pub use types::*;

/// Topic carrying worktree snapshots. The only topic the server publishes today.
pub const WORKTREES_TOPIC: &str = "worktrees";
