//! Transactions.
//!
//! - [`XactFactory`] boots the engine, runs restart recovery and starts
//!   transactions of every kind.
//! - [`Transaction`] is the state machine for one transaction object.
//! - [`TransactionTable`] tracks every live and recovering transaction.
//! - [`XaResourceManager`] resolves global transactions by global id.

mod context;
mod event;
mod factory;
mod post_commit;
mod recovery;
mod savepoint;
mod state;
mod table;
mod transaction;
mod xa;

pub use context::EngineContext;
pub use event::{TransactionEvent, TransactionListener};
pub use factory::{RecoverySummary, XactFactory};
pub use post_commit::{PostCommitQueue, ServiceOutcome, Serviceable};
pub use recovery::RedoSummary;
pub use savepoint::SavepointKind;
pub use state::{CommitFlags, TransactionKind, XactState, XactStatus};
pub use table::{CheckpointEntry, TransactionInfo, TransactionTable};
pub use transaction::{Transaction, XactContext};
pub use xa::{XaResourceManager, TMENDRSCAN, TMNOFLAGS, TMSTARTRSCAN, XA_OK, XA_RDONLY};
