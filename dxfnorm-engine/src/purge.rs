use dxfnorm_core::document::Document;
use tracing::{debug, info, warn};

use crate::report::PassReport;
use crate::resolver::{BlockGraph, removable_blocks};

/// 一次块清理的结果。
#[derive(Debug, Clone, Default)]
pub struct PurgeReport {
    /// 实际采用的删除顺序。
    pub order: Vec<String>,
    /// 引用图存在环时改用按名称长度排序。
    pub used_fallback: bool,
    pub outcomes: PassReport,
}

impl PurgeReport {
    pub fn deleted(&self) -> impl Iterator<Item = &str> {
        self.outcomes.applied()
    }
}

/// 引用关系无法求解时的退化顺序：名称（按字符计）长者在前，等长保持原顺序。
pub fn fallback_order(removable: &[String]) -> Vec<String> {
    let mut order = removable.to_vec();
    order.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
    order
}

/// 按依赖顺序逐个删除可删除的块定义。
///
/// 单个块删除失败（仍被引用等）只记录并跳过，不影响其余块。
pub fn purge_blocks(document: &mut Document) -> PurgeReport {
    let removable = removable_blocks(document);
    let graph = BlockGraph::build(document, &removable);
    let (order, used_fallback) = match graph.deletion_order() {
        Ok(order) => (order, false),
        Err(err) => {
            warn!(error = %err, "块引用图存在环，改用名称长度排序");
            (fallback_order(&removable), true)
        }
    };

    let mut outcomes = PassReport::new();
    for name in &order {
        match document.delete_block(name) {
            Ok(_) => {
                debug!(block = %name, "已删除块定义");
                outcomes.record_applied(name.as_str());
            }
            Err(err) => {
                warn!(block = %name, error = %err, "删除块定义失败，已跳过");
                outcomes.record_skipped(name.as_str(), err);
            }
        }
    }

    info!(
        candidates = order.len(),
        deleted = outcomes.applied_count(),
        skipped = outcomes.skipped_count(),
        fallback = used_fallback,
        "块清理完成"
    );

    PurgeReport {
        order,
        used_fallback,
        outcomes,
    }
}
