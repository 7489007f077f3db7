//! Voicenotes: moves voice notes posted in a chat into a local directory and
//! deletes the local copy when a participant reacts with a thumbs-up.
//!
//! Each invocation runs a single reconciliation pass and exits. Progress is
//! kept in a redb file so that an external scheduler can run it repeatedly
//! and a crash at any point is resumed by the next run.

pub mod classifier;
pub mod config;
pub mod cursor;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod messaging;
pub mod reconcile;
pub mod secrets;
pub mod state;

pub use error::{Error, Result};
