//! Arbor
//!
//! Keeps a live, ordered view of every feature worktree across a set of
//! projects (git facts, terminal session and AI activity, pull-request
//! status) and pushes it to observers over WebSocket.

pub mod ai_detect;
pub mod classifier;
pub mod config;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod git;
pub mod github;
pub mod logging;
pub mod paths;
pub mod persistence;
pub mod pr_cache;
pub mod process;
pub mod rows;
pub mod tmux;
pub mod watcher;
mod websocket;

#[cfg(test)]
mod testing;
