//! ABCI adapter between a BFT consensus engine and a blockchain backend
//!
//! ## Structure
//! - `app` - block cycle controller serving the consensus, mempool and query connections
//! - `backend` - the `Backend` gateway trait and the SQLite nonce-ledger reference backend
//! - `codec` - transaction wire format
//! - `validators` - validator roster and update strategies
//! - `query` - forwarding of query requests to the core RPC endpoint
//! - `network` - actix-web HTTP transport
//! - `config`, `logger`, `error`, `types` - shared plumbing

pub mod logger;

pub mod app;
pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod query;
pub mod types;
pub mod validators;

pub use app::{Application, CycleState};
pub use backend::{Backend, BackendError, LedgerBackend};
pub use config::AppConfig;
pub use error::{AbciError, AppResult, FatalCondition};
