//! Message ledger: the durable record of every voice note the agent knows about.

pub mod store;
pub mod types;

pub use store::MessageLedger;
pub use types::{MessageState, TrackedMessage};
