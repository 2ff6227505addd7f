//! Persistent entity types for the HMLR engine
//!
//! Every entity here is owned by the storage layer; other components hold
//! identifiers or transient copies only. Identifiers are human-readable
//! strings minted by [`crate::ids`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::next_id;

/// Compression state of a stored turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetailLevel {
    /// Full user/assistant text retained
    Verbatim,
    /// Older turn whose content has been reduced to `compressed_content`
    Compressed,
}

/// One user/assistant exchange
///
/// Immutable once written, except for the compression fields which the
/// sliding window may fill in as the turn ages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Unique identifier (`turn_...`)
    pub turn_id: String,

    /// Session the turn belongs to
    pub session_id: String,

    /// Day the turn belongs to (YYYY-MM-DD)
    pub day_id: String,

    /// Monotonic sequence number within the session
    pub turn_sequence: u64,

    /// When the exchange occurred
    pub timestamp: DateTime<Utc>,

    /// User's message (the only text ever embedded or scrubbed)
    pub user_message: String,

    /// Assistant's response
    pub assistant_response: String,

    /// Compression state
    #[serde(default = "DetailLevel::verbatim")]
    pub detail_level: DetailLevel,

    /// Reduced content when `detail_level` is `Compressed`
    #[serde(default)]
    pub compressed_content: Option<String>,

    /// Extracted keywords
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Active topics
    #[serde(default)]
    pub topics: Vec<String>,

    /// Coarse affect label
    #[serde(default)]
    pub affect: Option<String>,
}

impl DetailLevel {
    const fn verbatim() -> Self {
        Self::Verbatim
    }
}

impl ConversationTurn {
    /// Create a verbatim turn with a fresh id
    #[must_use]
    pub fn new(
        session_id: String,
        day_id: String,
        turn_sequence: u64,
        user_message: String,
        assistant_response: String,
    ) -> Self {
        Self {
            turn_id: next_id("turn"),
            session_id,
            day_id,
            turn_sequence,
            timestamp: Utc::now(),
            user_message,
            assistant_response,
            detail_level: DetailLevel::Verbatim,
            compressed_content: None,
            keywords: Vec::new(),
            topics: Vec::new(),
            affect: None,
        }
    }

    /// Text the window renders for this turn: compressed when available
    #[must_use]
    pub fn window_text(&self) -> String {
        match (&self.detail_level, &self.compressed_content) {
            (DetailLevel::Compressed, Some(compressed)) => compressed.clone(),
            _ => format!(
                "User: {}\nAssistant: {}",
                self.user_message, self.assistant_response
            ),
        }
    }
}

/// Level of a chunk in the turn/paragraph/sentence hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    /// Whole-turn chunk (no parent)
    Turn,
    /// Paragraph, child of the turn chunk
    Paragraph,
    /// Sentence, child of a paragraph chunk
    Sentence,
}

/// Hierarchical fragment of a turn
///
/// Invariant: every non-`Turn` chunk has a parent in the same turn whose
/// type is one level higher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique identifier; incorporates the parent id
    pub chunk_id: String,

    /// Owning turn
    pub turn_id: String,

    /// Optional span within a larger document
    #[serde(default)]
    pub span_id: Option<String>,

    /// Hierarchy level
    pub chunk_type: ChunkType,

    /// Parent chunk, absent for the `Turn` level
    #[serde(default)]
    pub parent_chunk_id: Option<String>,

    /// Exact text of the fragment
    pub text_verbatim: String,

    /// Approximate token count (`ceil(len / 4)`)
    pub token_count: usize,
}

/// Lifecycle state of a Bridge Block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockStatus {
    /// Receiving turns; at most one per day
    Active,
    /// Set aside; may be resumed
    Paused,
    /// Finished; never becomes active again
    Closed,
}

impl BlockStatus {
    /// Stable string form used in the `daily_ledger` status column
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Closed => "CLOSED",
        }
    }

    /// Parse the column form back
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "PAUSED" => Some(Self::Paused),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Snapshot of a turn as appended to a block's ordered turn list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTurn {
    /// Turn identifier
    pub turn_id: String,
    /// Sequence number; strictly increasing along the block
    pub turn_sequence: u64,
    /// When the exchange occurred
    pub timestamp: DateTime<Utc>,
    /// User's message
    pub user_message: String,
    /// Assistant's response
    pub assistant_response: String,
}

/// Topic summary and metadata attached to a block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    /// LLM-generated topic summary; empty until the first pause/close
    #[serde(default)]
    pub summary: String,

    /// Free-form metadata merged from LLM metadata emissions
    #[serde(default)]
    pub metadata: Value,

    /// Set when summary generation failed on a transition
    #[serde(default)]
    pub needs_summary_repair: bool,

    /// Set when the Gardener has promoted this block
    #[serde(default)]
    pub gardened: bool,
}

/// An ordered, same-topic group of turns within a day
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeBlock {
    /// Unique identifier (`block_...`)
    pub block_id: String,

    /// Day the block belongs to
    pub day_id: String,

    /// Short human topic label
    pub topic_label: String,

    /// Keywords captured at creation
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Lifecycle state
    pub status: BlockStatus,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last mutation time
    pub last_updated: DateTime<Utc>,

    /// Append-only turn list, ordered by `turn_sequence`
    #[serde(default)]
    pub turns: Vec<BlockTurn>,

    /// Topic summary + metadata
    #[serde(default)]
    pub header: BlockHeader,
}

impl BridgeBlock {
    /// Create a fresh `Active` block
    #[must_use]
    pub fn new(day_id: String, topic_label: String, keywords: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            block_id: next_id("block"),
            day_id,
            topic_label,
            keywords,
            status: BlockStatus::Active,
            created_at: now,
            last_updated: now,
            turns: Vec::new(),
            header: BlockHeader::default(),
        }
    }
}

/// An extracted atomic claim, linked to its originating turn and chunk
///
/// Immutable once written. `source_block_id` is null at extraction time and
/// back-filled once the Governor assigns a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    /// Unique identifier (`fact_...`)
    pub fact_id: String,

    /// Claim key, e.g. `dietary_preference`
    pub key: String,

    /// Claim value, e.g. `strictly vegetarian`
    pub value: String,

    /// Heuristic category, e.g. `constraint`, `environment`
    pub category: String,

    /// Turn the fact was scrubbed from
    pub turn_id: String,

    /// Sentence- or turn-level chunk whose text contains the value
    pub source_chunk_id: String,

    /// Block assigned after routing; null until back-filled
    #[serde(default)]
    pub source_block_id: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Fact {
    /// Rendered `key: value` form used for embedding and display
    #[must_use]
    pub fn as_text(&self) -> String {
        format!("{}: {}", self.key, self.value)
    }
}

/// A sticky tag applying to a whole block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTag {
    /// Sticky category (`constraint`, `preference`, ...)
    pub category: String,
    /// Tag text
    pub value: String,
}

/// A sticky rule bounded to a turn range within a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRule {
    /// First turn the rule applies to
    pub start_turn: String,
    /// Last turn the rule applies to
    pub end_turn: String,
    /// Rule text
    pub rule: String,
}

/// Gardener-written side metadata for a block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// Tags that apply to the whole block
    #[serde(default)]
    pub global_tags: Vec<GlobalTag>,
    /// Rules bounded to turn ranges
    #[serde(default)]
    pub section_rules: Vec<SectionRule>,
}

/// A long-lived, semantically clustered fact collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dossier {
    /// Unique identifier (`dossier_...`)
    pub dossier_id: String,

    /// Title, seeded from the founding packet's cluster label
    pub title: String,

    /// Narrative summary of the dossier's facts
    pub summary: String,

    /// Dense paraphrase used for coarse retrieval
    pub search_summary: String,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last append/update time
    pub last_updated: DateTime<Utc>,
}

/// A fact as owned by a dossier
///
/// `fact_text` is a copy, kept stable under fact-store changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DossierFact {
    /// Fact identifier (foreign key into the fact store)
    pub fact_id: String,
    /// Owning dossier
    pub dossier_id: String,
    /// Stable copy of the fact text
    pub fact_text: String,
}

/// Dossier lifecycle operation recorded in provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvenanceOp {
    /// Dossier minted for a packet
    Create,
    /// Packet facts appended to an existing dossier
    Append,
    /// Two dossiers merged by explicit policy
    Merge,
    /// Summary/search-summary regenerated
    UpdateSummary,
}

impl ProvenanceOp {
    /// Stable column form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Append => "APPEND",
            Self::Merge => "MERGE",
            Self::UpdateSummary => "UPDATE_SUMMARY",
        }
    }

    /// Parse the column form back
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(Self::Create),
            "APPEND" => Some(Self::Append),
            "MERGE" => Some(Self::Merge),
            "UPDATE_SUMMARY" => Some(Self::UpdateSummary),
            _ => None,
        }
    }
}

/// Append-only provenance log row for a dossier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DossierProvenance {
    /// Unique identifier (`prov_...`)
    pub prov_id: String,
    /// Dossier the operation applied to
    pub dossier_id: String,
    /// Operation kind
    pub operation: ProvenanceOp,
    /// Block that triggered the operation, when applicable
    #[serde(default)]
    pub source_block_id: Option<String>,
    /// When the operation happened
    pub timestamp: DateTime<Utc>,
    /// Operation-specific payload
    #[serde(default)]
    pub payload: Value,
}

/// Gardener-emitted bundle of semantically grouped facts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactPacket {
    /// Cluster label, becomes the dossier title on CREATE
    pub cluster_label: String,
    /// Facts in the cluster
    pub facts: Vec<Fact>,
    /// Block the facts were promoted from
    pub source_block_id: String,
    /// Promotion time
    pub timestamp: DateTime<Utc>,
}

/// Routing verdict produced by the Governor's routing task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Existing block the query continues or resumes, if any
    #[serde(default)]
    pub matched_block_id: Option<String>,
    /// Whether the query opens a new topic
    #[serde(default)]
    pub is_new_topic: bool,
    /// Label for a newly created block
    #[serde(default = "RoutingDecision::default_label")]
    pub suggested_label: String,
}

impl RoutingDecision {
    fn default_label() -> String {
        "General Discussion".to_string()
    }
}

impl Default for RoutingDecision {
    /// The defensive fallback used when the routing task fails
    fn default() -> Self {
        Self {
            matched_block_id: None,
            is_new_topic: true,
            suggested_label: Self::default_label(),
        }
    }
}

/// Which ledger scenario a routing decision resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingScenario {
    /// Matched the currently active block; no status change
    Continuation,
    /// Reactivated a paused block; previous active paused
    Resumption,
    /// No prior active block; created a fresh one
    NewFirst,
    /// Prior active paused; created a fresh one
    Shift,
    /// Indeterminate decision; defensively created a fresh block
    Fallback,
}

/// A memory index hit returned by the Governor
#[derive(Debug, Clone)]
pub struct MemoryHit {
    /// Index id that matched (turn id or sentence-chunk id)
    pub id: String,
    /// Turn the hit belongs to
    pub turn_id: String,
    /// Block the turn belongs to, when known
    pub block_id: Option<String>,
    /// Matched text
    pub text: String,
    /// Cosine similarity
    pub score: f32,
}

/// A dossier candidate hydrated with its fact list
#[derive(Debug, Clone)]
pub struct DossierHit {
    /// The dossier row
    pub dossier: Dossier,
    /// Full fact list of the dossier
    pub facts: Vec<DossierFact>,
    /// Number of fact-level vector votes
    pub hit_count: usize,
    /// Best vote similarity
    pub max_similarity: f32,
}

/// Joined output of the Governor's parallel fan-out
#[derive(Debug, Clone, Default)]
pub struct GovernorOutput {
    /// Routing verdict (fallback default when the task failed)
    pub routing: RoutingDecision,
    /// Long-term memory hits
    pub memories: Vec<MemoryHit>,
    /// Keyword-matched facts
    pub facts: Vec<Fact>,
    /// Dossier candidates
    pub dossiers: Vec<DossierHit>,
}

/// Outcome status of a processed turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    /// Turn committed and answered
    Success,
    /// Answered without full memory support
    Partial,
    /// Turn invalidated; nothing persisted
    Error,
}

/// User-visible result envelope for one processed message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    /// Response text shown to the user (metadata block stripped)
    pub text: String,
    /// Outcome status
    pub status: ResponseStatus,
    /// Wall-clock processing time
    pub processing_time_ms: u64,
    /// Error detail when status is not `Success`
    #[serde(default)]
    pub error: Option<String>,
}

impl EngineResponse {
    /// Build an error envelope
    #[must_use]
    pub fn error(text: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: ResponseStatus::Error,
            processing_time_ms: 0,
            error: Some(detail.into()),
        }
    }
}

/// Metadata block parsed from the main model's response
///
/// The header update is skipped on `ParseError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmMetadata {
    /// Well-formed metadata object
    Parsed {
        /// The metadata fields
        fields: serde_json::Map<String, Value>,
    },
    /// The fenced block did not parse as a JSON object
    ParseError {
        /// The raw block text, kept for diagnostics
        raw_text: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_status_roundtrip() {
        for status in [BlockStatus::Active, BlockStatus::Paused, BlockStatus::Closed] {
            assert_eq!(BlockStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BlockStatus::parse("OPEN"), None);
    }

    #[test]
    fn test_provenance_op_roundtrip() {
        for op in [
            ProvenanceOp::Create,
            ProvenanceOp::Append,
            ProvenanceOp::Merge,
            ProvenanceOp::UpdateSummary,
        ] {
            assert_eq!(ProvenanceOp::parse(op.as_str()), Some(op));
        }
    }

    #[test]
    fn test_routing_decision_fallback() {
        let fallback = RoutingDecision::default();
        assert!(fallback.matched_block_id.is_none());
        assert!(fallback.is_new_topic);
        assert_eq!(fallback.suggested_label, "General Discussion");
    }

    #[test]
    fn test_turn_window_text_prefers_compressed() {
        let mut turn = ConversationTurn::new(
            "s1".into(),
            "2026-08-01".into(),
            1,
            "long question".into(),
            "long answer".into(),
        );
        assert!(turn.window_text().contains("long question"));

        turn.detail_level = DetailLevel::Compressed;
        turn.compressed_content = Some("short".into());
        assert_eq!(turn.window_text(), "short");
    }

    #[test]
    fn test_fact_as_text() {
        let fact = Fact {
            fact_id: "fact_1".into(),
            key: "diet".into(),
            value: "vegetarian".into(),
            category: "constraint".into(),
            turn_id: "turn_1".into(),
            source_chunk_id: "turn_1_p0_s0".into(),
            source_block_id: None,
            created_at: Utc::now(),
        };
        assert_eq!(fact.as_text(), "diet: vegetarian");
    }

    #[test]
    fn test_new_block_is_active() {
        let block = BridgeBlock::new("2026-08-01".into(), "Cars".into(), vec!["cars".into()]);
        assert_eq!(block.status, BlockStatus::Active);
        assert!(block.turns.is_empty());
        assert!(!block.header.gardened);
    }

    #[test]
    fn test_detail_level_serde_form() {
        let json = serde_json::to_string(&DetailLevel::Verbatim).unwrap();
        assert_eq!(json, "\"VERBATIM\"");
    }
}
