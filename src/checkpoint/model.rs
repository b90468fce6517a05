//! Parse-merge checkpoint record.
//!
//! One record per run. Every field the chunker needs to resume lives here;
//! no in-memory state survives across invocations. Writes go through the
//! store as shallow JSON merges, so the patch type mirrors the record with
//! all-optional fields.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sub-phase of a parse-merge run. Once `completed` is reached the phase
/// never transitions again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubPhase {
    #[default]
    Pending,
    BuildingStockIndex,
    BuildingPriceIndex,
    PreparingMaterial,
    InProgress,
    Finalizing,
    #[serde(alias = "success")]
    Completed,
    Failed,
}

impl SubPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubPhase::Pending => "pending",
            SubPhase::BuildingStockIndex => "building_stock_index",
            SubPhase::BuildingPriceIndex => "building_price_index",
            SubPhase::PreparingMaterial => "preparing_material",
            SubPhase::InProgress => "in_progress",
            SubPhase::Finalizing => "finalizing",
            SubPhase::Completed => "completed",
            SubPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubPhase::Completed | SubPhase::Failed)
    }
}

/// Rows dropped by the merge filter, by reason. Keys mirror the
/// orchestrator's JSON (`noStock`, ...). Monotone within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SkipCounters {
    pub no_stock: u64,
    pub no_price: u64,
    pub low_stock: u64,
    pub no_valid: u64,
}

impl SkipCounters {
    pub fn total(&self) -> u64 {
        self.no_stock + self.no_price + self.low_stock + self.no_valid
    }

    pub fn add(&mut self, other: &SkipCounters) {
        self.no_stock += other.no_stock;
        self.no_price += other.no_price;
        self.low_stock += other.low_stock;
        self.no_valid += other.no_valid;
    }
}

/// Durable continuation state for one run's parse-merge step.
///
/// Invariants: `cursor` is monotone non-decreasing; `carry` never exceeds
/// the chunker's carry bound; counters only grow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParseMergeCheckpoint {
    pub phase: SubPhase,
    /// Byte cursor into the material feed.
    pub cursor: u64,
    /// Total material byte count, known after the header probe.
    pub total_bytes: u64,
    /// Output chunks emitted so far.
    pub chunk_count: u32,
    /// Next chunk index the finalizer will append.
    pub finalize_chunk: u32,
    /// Next material part index in chunk-file fallback mode.
    pub material_chunk: u32,
    /// Tail bytes after the last newline of the previous fetch.
    #[serde(with = "carry_b64")]
    pub carry: Vec<u8>,
    pub skips: SkipCounters,
    pub product_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// One-shot flag: a missing artifact has already triggered a rebuild.
    pub artifact_rebuild_attempted: bool,
}

/// Shallow-merge patch for [`ParseMergeCheckpoint`]. Only the populated
/// fields reach the store, so concurrent writers never stomp fields they
/// did not touch.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<SubPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalize_chunk: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material_chunk: Option<u32>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "carry_b64::serialize_opt"
    )]
    pub carry: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skips: Option<SkipCounters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_rebuild_attempted: Option<bool>,
}

impl CheckpointPatch {
    pub fn phase(phase: SubPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Self::default()
        }
    }

    /// Patch that resets a run back to `pending` for the one-shot artifact
    /// rebuild. Counters and cursor restart; the rebuild flag stays set so a
    /// second missing artifact is fatal.
    pub fn rebuild_reset() -> Self {
        Self {
            phase: Some(SubPhase::Pending),
            cursor: Some(0),
            total_bytes: Some(0),
            chunk_count: Some(0),
            finalize_chunk: Some(0),
            material_chunk: Some(0),
            carry: Some(Vec::new()),
            skips: Some(SkipCounters::default()),
            product_count: Some(0),
            artifact_rebuild_attempted: Some(true),
            ..Self::default()
        }
    }
}

/// Carry bytes are raw (they may end mid-character), so JSON carries them
/// base64-encoded.
mod carry_b64 {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(bytes))
    }

    pub fn serialize_opt<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serialize(b, ser),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        BASE64
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
