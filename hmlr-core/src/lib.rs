//! # HMLR Core
//!
//! Shared foundation for the Hierarchical Memory & Long-Term Retrieval
//! engine: the persistent entity types, the error taxonomy, the
//! language-model and embedding seams, identifier generation, and runtime
//! configuration.
//!
//! ## Architecture
//!
//! ```text
//! hmlr-core
//! ├── types      (Turn / Chunk / BridgeBlock / Fact / Dossier / ...)
//! ├── error      (HmlrError taxonomy + Result alias)
//! ├── traits     (LlmClient, EmbeddingProvider)
//! ├── ids        (<prefix>_<timestamp>_<counter> generator)
//! └── config     (HmlrConfig with env overrides)
//! ```

pub mod config;
pub mod error;
pub mod ids;
pub mod traits;
pub mod types;

pub use config::HmlrConfig;
pub use error::{HmlrError, Result};
pub use traits::{EmbeddingProvider, LlmClient};
pub use types::{
    BlockHeader, BlockMetadata, BlockStatus, BlockTurn, BridgeBlock, Chunk, ChunkType,
    ConversationTurn, DetailLevel, Dossier, DossierFact, DossierHit, DossierProvenance,
    EngineResponse, Fact, FactPacket, GlobalTag, GovernorOutput, LlmMetadata, MemoryHit,
    ProvenanceOp, ResponseStatus, RoutingDecision, RoutingScenario, SectionRule,
};
