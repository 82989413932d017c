//! 单份图纸的规范化流水线。

use dxfnorm_core::document::{Document, Space};
use dxfnorm_core::remap::RemapEntry;
use tracing::info;

use crate::clouds::{CloudReport, DEFAULT_SEGMENT_LENGTH, reconstruct_clouds};
use crate::errors::EngineError;
use crate::explode::{DEFAULT_PASS_LIMIT, ExplodeReport, explode_all};
use crate::layers::{RemapReport, apply_remap_table, prune_unused_layers};
use crate::merge::{MergeReport, merge_into};
use crate::purge::{PurgeReport, purge_blocks};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// 需要重建修订云线的图层。
    pub cloud_layers: Vec<String>,
    pub cloud_segment_length: f64,
    pub explode_pass_limit: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            cloud_layers: Vec::new(),
            cloud_segment_length: DEFAULT_SEGMENT_LENGTH,
            explode_pass_limit: DEFAULT_PASS_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeReport {
    pub explode: ExplodeReport,
    pub purge: PurgeReport,
    pub pruned_before: Vec<String>,
    pub remap: RemapReport,
    pub merge: MergeReport,
    pub pruned_after: Vec<String>,
    pub clouds: CloudReport,
}

/// 标志源文档在合并前只需炸开并清理一次，之后可被所有图纸复用。
pub fn prepare_logo(mut logo: Document, explode_pass_limit: usize) -> Result<Document, EngineError> {
    explode_all(&mut logo, explode_pass_limit)?;
    purge_blocks(&mut logo);
    Ok(logo)
}

/// 依次执行：炸开块参照、清理块、清理图层、图层映射与随层化、合并标志、
/// 再次清理图层、重建修订云线。任一步骤返回错误即放弃该文档。
pub fn normalize_document(
    document: &mut Document,
    table: &[RemapEntry],
    logo: &Document,
    options: &PipelineOptions,
) -> Result<NormalizeReport, EngineError> {
    let explode = explode_all(document, options.explode_pass_limit)?;
    let purge = purge_blocks(document);
    let pruned_before = prune_unused_layers(document);
    let remap = apply_remap_table(document, table)?;
    let merge = merge_into(logo, document, &Space::Model)?;
    let pruned_after = prune_unused_layers(document);
    let clouds = reconstruct_clouds(
        document,
        &Space::Model,
        &options.cloud_layers,
        options.cloud_segment_length,
    )?;

    info!(
        exploded = explode.exploded,
        purged = purge.outcomes.applied_count(),
        pruned = pruned_before.len() + pruned_after.len(),
        remapped = remap.entities_moved,
        merged = merge.entities.applied_count(),
        clouds = clouds.len(),
        "图纸规范化完成"
    );

    Ok(NormalizeReport {
        explode,
        purge,
        pruned_before,
        remap,
        merge,
        pruned_after,
        clouds,
    })
}
