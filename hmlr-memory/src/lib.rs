//! # HMLR Memory
//!
//! The Hierarchical Memory & Long-Term Retrieval subsystems: the Bridge
//! Block ledger, fact scrubbing, the Governor's retrieval fan-out, the
//! Gardener's offline promotion, dossier routing with multi-vector
//! voting, context hydration, and the conversation engine tying them
//! together.
//!
//! ## Data flow
//!
//! ```text
//! user message → ChunkEngine → (FactScrubber ∥ Governor)
//!              → BridgeLedger.apply_routing → ContextHydrator → main LLM
//!              → append + embed → (eventually) Gardener → DossierRouter
//! ```

pub mod background;
pub mod chunker;
pub mod dossier;
pub mod embeddings;
pub mod engine;
pub mod gardener;
pub mod governor;
pub mod hydrator;
pub mod ledger;
pub mod profile;
pub mod prompts;
pub mod scrubber;
pub mod window;

pub use background::BackgroundTasks;
pub use chunker::ChunkEngine;
pub use dossier::{DossierRouter, RouteOutcome};
pub use embeddings::{CachedEmbeddingService, EmbeddingService};
pub use engine::ConversationEngine;
pub use gardener::{Gardener, GardeningReport};
pub use governor::Governor;
pub use hydrator::{ContextHydrator, HydrationInput};
pub use ledger::BridgeLedger;
pub use profile::{Constraint, ProfileStore, Scribe, UserProfile};
pub use scrubber::FactScrubber;
pub use window::SlidingWindow;
