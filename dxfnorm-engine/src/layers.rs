//! 图层规范化：建层、线宽、清理未用图层、按映射表迁移实体并统一为随层样式。

use std::collections::HashSet;

use dxfnorm_core::document::{Document, LAYER_DEFPOINTS, LAYER_ZERO, Layer, Space};
use dxfnorm_core::errors::DocumentError;
use dxfnorm_core::remap::{MAX_LINEWEIGHT, RemapEntry, RemapRow};
use tracing::{debug, info, warn};

use crate::errors::EngineError;

/// 自动清理永远保留的图层。
pub const RESERVED_LAYERS: [&str; 2] = [LAYER_DEFPOINTS, LAYER_ZERO];

/// 图层不存在时以给定颜色新建，返回是否新建。
pub fn create_layer(document: &mut Document, name: &str, color: i16) -> Result<bool, DocumentError> {
    if document.has_layer(name) {
        return Ok(false);
    }
    document.add_layer(Layer::with_color(name, color))?;
    debug!(layer = name, color, "已新建图层");
    Ok(true)
}

/// 以 0.1 为刻度存储线宽：`round(weight * 10)`。图层不存在时不做任何事。
///
/// 超出 `0..=MAX_LINEWEIGHT` 的结果截断到边界并记录警告。
pub fn set_line_weight(document: &mut Document, name: &str, weight: f64) -> bool {
    let Some(layer) = document.layer_mut(name) else {
        return false;
    };
    let scaled = (weight * 10.0).round();
    let stored = if scaled.is_nan() {
        0.0
    } else {
        scaled.clamp(0.0, f64::from(MAX_LINEWEIGHT))
    };
    if stored != scaled {
        warn!(layer = name, weight, stored, "线宽超出 DXF 范围，已截断");
    }
    layer.lineweight = stored as i16;
    true
}

/// 删除没有任何实体引用的图层，保留图层 "0" 与 "Defpoints"。返回被删除的图层名。
///
/// 引用统计覆盖模型空间、全部图纸空间以及仍留在文档中的块定义；
/// 重复调用不会再删除任何图层。
pub fn prune_unused_layers(document: &mut Document) -> Vec<String> {
    let mut used: HashSet<String> = RESERVED_LAYERS
        .iter()
        .map(|name| name.to_ascii_uppercase())
        .collect();
    used.extend(
        document
            .entities()
            .map(|(_, entity)| entity.layer_name().to_ascii_uppercase()),
    );
    let sheets: Vec<String> = document.sheet_names().map(str::to_string).collect();
    for sheet in sheets {
        if let Ok(entities) = document.space_entities(&Space::Sheet(sheet)) {
            used.extend(
                entities
                    .iter()
                    .map(|(_, entity)| entity.layer_name().to_ascii_uppercase()),
            );
        }
    }
    for block in document.blocks() {
        used.extend(
            block
                .entities
                .iter()
                .map(|entity| entity.layer_name().to_ascii_uppercase()),
        );
    }

    let unused: Vec<String> = document
        .layer_names()
        .into_iter()
        .filter(|name| !used.contains(&name.to_ascii_uppercase()))
        .collect();
    let mut removed = Vec::with_capacity(unused.len());
    for name in unused {
        if document.remove_layer(&name).is_ok() {
            removed.push(name);
        }
    }
    if !removed.is_empty() {
        debug!(removed = ?removed, "已清理未使用图层");
    }
    removed
}

/// 将模型空间中位于 `source` 图层的实体改到 `dest` 图层，返回迁移数量。
pub fn remap_entities(document: &mut Document, source: &str, dest: &str) -> usize {
    let mut moved = 0;
    for entity in document.entities_mut() {
        if entity.layer_name().eq_ignore_ascii_case(source) {
            entity.set_layer(dest);
            moved += 1;
        }
    }
    if moved > 0 {
        document.ensure_layer(dest);
    }
    moved
}

/// 模型空间中所有实体的颜色、线宽、线型改为随层，返回原本不是随层的实体数。
pub fn reset_entity_styles(document: &mut Document) -> usize {
    let mut changed = 0;
    for entity in document.entities_mut() {
        let attrs = entity.attributes_mut();
        if !attrs.is_bylayer() {
            changed += 1;
        }
        attrs.reset_to_bylayer();
    }
    changed
}

/// 源图层存在于文档中的映射行（保留表内序号），按表格顺序。
pub fn select_remap_rows<'a>(
    document: &Document,
    table: &'a [RemapEntry],
) -> Vec<(usize, &'a RemapEntry)> {
    table
        .iter()
        .enumerate()
        .filter(|(_, entry)| document.has_layer(&entry.source_layer()))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct RemapReport {
    pub rows: Vec<RemapRow>,
    pub layers_created: Vec<String>,
    pub entities_moved: usize,
    pub entities_restyled: usize,
}

/// 应用映射表：逐行建层、迁移实体、设置线宽，最后把全部实体样式改为随层。
///
/// 选中行先全部补齐默认值并校验，任一行不合法则整份文档不做修改并返回错误。
pub fn apply_remap_table(
    document: &mut Document,
    table: &[RemapEntry],
) -> Result<RemapReport, EngineError> {
    let rows = select_remap_rows(document, table)
        .into_iter()
        .map(|(index, entry)| entry.resolve(index))
        .collect::<Result<Vec<_>, _>>()?;

    let mut report = RemapReport::default();
    for row in &rows {
        if create_layer(document, &row.dest_layer, row.color)? {
            report.layers_created.push(row.dest_layer.clone());
        }
        let moved = remap_entities(document, &row.source_layer, &row.dest_layer);
        set_line_weight(document, &row.dest_layer, row.lineweight);
        debug!(
            source = %row.source_layer,
            dest = %row.dest_layer,
            color = row.color,
            lineweight = row.lineweight,
            moved,
            "已应用图层映射"
        );
        report.entities_moved += moved;
    }
    report.entities_restyled = reset_entity_styles(document);
    info!(
        rows = rows.len(),
        created = report.layers_created.len(),
        moved = report.entities_moved,
        restyled = report.entities_restyled,
        "图层映射完成"
    );
    report.rows = rows;
    Ok(report)
}

/// 模型空间中仍处于给定图层的实体数量。
pub fn count_on_layer(document: &Document, layer: &str) -> usize {
    document
        .entities()
        .filter(|(_, entity)| entity.layer_name().eq_ignore_ascii_case(layer))
        .count()
}
