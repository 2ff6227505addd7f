//! # HMLR Storage
//!
//! libsql-backed persistence for the HMLR memory engine. The database
//! exclusively owns every persistent row; other crates hold identifiers or
//! transient copies only.
//!
//! ## Architecture
//!
//! ```text
//! SqliteBackend (schema + migrations)
//! ├── TurnStore     (turns, chunks)
//! ├── LedgerStore   (daily_ledger, block_metadata)
//! ├── FactStore     (fact_store)
//! ├── DossierStore  (dossiers, dossier_facts, dossier_provenance)
//! └── VectorIndex   (embeddings, dossier_fact_embeddings,
//!                    dossier_search_embeddings)
//! ```

pub mod backend;
pub mod codec;
pub mod dossiers;
pub mod facts;
pub mod ledger;
pub mod turns;
pub mod vector;

pub use backend::SqliteBackend;
pub use dossiers::DossierStore;
pub use facts::FactStore;
pub use ledger::LedgerStore;
pub use turns::TurnStore;
pub use vector::{FactMatch, MemoryMatch, VectorIndex};
