use std::num::NonZeroU64;

use serde::Serialize;

use crate::archive::target::DownloadTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStrategy {
    DirectStream,
    MultipartManifest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StrategyDecision {
    pub strategy: DownloadStrategy,
    pub total_size: u64,
    /// `ceil(total / threshold)`, 1 for direct streams
    pub estimated_parts: u64,
}

/// Pure: the same target and settings always give the same decision.
pub fn select_strategy(
    target: &DownloadTarget,
    multipart_enabled: bool,
    chunk_size: NonZeroU64,
) -> StrategyDecision {
    let total_size = target.total_size();

    if multipart_enabled && total_size > chunk_size.get() {
        StrategyDecision {
            strategy: DownloadStrategy::MultipartManifest,
            total_size,
            estimated_parts: total_size.div_ceil(chunk_size.get()),
        }
    } else {
        StrategyDecision {
            strategy: DownloadStrategy::DirectStream,
            total_size,
            estimated_parts: 1,
        }
    }
}
