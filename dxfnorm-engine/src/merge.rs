//! 跨文档合并：把源文档模型空间的实体、线型、文字样式复制到目标文档的指定空间。

use dxfnorm_core::document::{
    Document, Entity, EntityId, LineType, RasterImageDefinition, Space, TextStyle,
};
use dxfnorm_core::errors::DocumentError;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::layers::{create_layer, set_line_weight};
use crate::report::PassReport;

pub const DEFAULT_LINETYPE_PATTERN: [f64; 3] = [0.5, -0.25, 0.5];
pub const DEFAULT_LINETYPE_DESCRIPTION: &str = "Copied linetype";
pub const DEFAULT_FONT: &str = "arial.ttf";

#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub images_removed: usize,
    /// 删除图像后不再被引用的图像定义数量。
    pub image_definitions_removed: usize,
    pub linetypes: PassReport,
    pub text_styles: PassReport,
    pub entities: PassReport,
}

/// 合并源文档到目标空间：
/// 1. 删除目标空间中已有的光栅图像；
/// 2. 复制目标缺少的线型与文字样式（缺省值补齐）；
/// 3. 逐个深拷贝源模型空间实体，单个实体失败只记录并跳过；
/// 4. 丢弃目标中已无图像引用的图像定义。
pub fn merge_into(
    source: &Document,
    target: &mut Document,
    space: &Space,
) -> Result<MergeReport, EngineError> {
    let mut report = MergeReport {
        images_removed: target
            .remove_entities_where(space, Entity::is_raster_image)?
            .len(),
        ..MergeReport::default()
    };

    for linetype in source.linetypes() {
        if target.has_linetype(&linetype.name) {
            continue;
        }
        let copy = LineType {
            name: linetype.name.clone(),
            description: Some(
                linetype
                    .description
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LINETYPE_DESCRIPTION.to_string()),
            ),
            pattern: Some(
                linetype
                    .pattern
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LINETYPE_PATTERN.to_vec()),
            ),
        };
        match target.add_linetype(copy) {
            Ok(()) => report.linetypes.record_applied(linetype.name.as_str()),
            Err(err) => {
                warn!(linetype = %linetype.name, error = %err, "复制线型失败，已跳过");
                report.linetypes.record_skipped(linetype.name.as_str(), err);
            }
        }
    }

    for style in source.text_styles() {
        if target.has_text_style(&style.name) {
            continue;
        }
        let copy = TextStyle {
            name: style.name.clone(),
            font: Some(style.font.clone().unwrap_or_else(|| DEFAULT_FONT.to_string())),
            height: style.height,
        };
        match target.add_text_style(copy) {
            Ok(()) => report.text_styles.record_applied(style.name.as_str()),
            Err(err) => {
                warn!(style = %style.name, error = %err, "复制文字样式失败，已跳过");
                report.text_styles.record_skipped(style.name.as_str(), err);
            }
        }
    }

    for (id, entity) in source.space_entities(&Space::Model)? {
        let subject = format!("{} #{}", entity.kind_name(), id.get());
        match copy_entity(source, target, space, entity) {
            Ok(copied) => {
                debug!(entity = id.get(), copied = copied.get(), kind = entity.kind_name(), "已复制实体");
                report.entities.record_applied(subject);
            }
            Err(err) => {
                warn!(entity = id.get(), kind = entity.kind_name(), error = %err, "复制实体失败，已跳过");
                report.entities.record_skipped(subject, err);
            }
        }
    }

    for definition in target.prune_image_definitions() {
        debug!(handle = %definition.handle, path = %definition.file_path, "已删除无引用的图像定义");
        report.image_definitions_removed += 1;
    }

    info!(
        space = %space,
        images_removed = report.images_removed,
        image_definitions_removed = report.image_definitions_removed,
        linetypes = report.linetypes.applied_count(),
        text_styles = report.text_styles.applied_count(),
        entities = report.entities.applied_count(),
        skipped = report.entities.skipped_count(),
        "文档合并完成"
    );
    Ok(report)
}

/// 按源文档图层在目标中建层（已存在则保留颜色），并同步线宽。
/// 报告只记录新建的图层。
pub fn merge_layers(source: &Document, target: &mut Document) -> PassReport {
    let mut report = PassReport::new();
    for layer in source.layers() {
        match create_layer(target, &layer.name, layer.color) {
            Ok(created) => {
                set_line_weight(target, &layer.name, f64::from(layer.lineweight) / 10.0);
                if created {
                    report.record_applied(layer.name.as_str());
                }
            }
            Err(err) => {
                warn!(layer = %layer.name, error = %err, "复制图层失败，已跳过");
                report.record_skipped(layer.name.as_str(), err);
            }
        }
    }
    report
}

fn copy_entity(
    source: &Document,
    target: &mut Document,
    space: &Space,
    entity: &Entity,
) -> Result<EntityId, DocumentError> {
    let mut copy = entity.clone();
    match &mut copy {
        Entity::RasterImage(image) => {
            image.image_def_handle = import_image_definition(source, target, &image.image_def_handle)?;
        }
        Entity::BlockReference(reference) => import_block(source, target, &reference.name)?,
        _ => {}
    }
    target.add_entity_to(space, copy)
}

/// 把图像定义带到目标文档，返回目标中的句柄。同一路径的定义复用，句柄冲突时重新分配。
fn import_image_definition(
    source: &Document,
    target: &mut Document,
    handle: &str,
) -> Result<String, DocumentError> {
    let definition = source
        .image_definition(handle)
        .ok_or_else(|| DocumentError::UnknownImageDefinition(handle.to_string()))?;
    if let Some(existing) = target
        .image_definitions()
        .find(|existing| existing.file_path == definition.file_path)
    {
        return Ok(existing.handle.clone());
    }
    let handle = if target.image_definition(&definition.handle).is_some() {
        target.allocate_handle()
    } else {
        definition.handle.clone()
    };
    target.add_image_definition(RasterImageDefinition {
        handle: handle.clone(),
        ..definition.clone()
    });
    Ok(handle)
}

/// 目标缺少块定义时连同其嵌套块一并复制。
fn import_block(source: &Document, target: &mut Document, name: &str) -> Result<(), DocumentError> {
    if target.has_block(name) {
        return Ok(());
    }
    let block = source
        .block(name)
        .ok_or_else(|| DocumentError::UnknownBlock(name.to_string()))?;
    let mut copy = block.clone();
    for entity in &mut copy.entities {
        if let Entity::RasterImage(image) = entity {
            image.image_def_handle = import_image_definition(source, target, &image.image_def_handle)?;
        }
    }
    target.add_block_definition(copy);
    for nested in block.referenced_blocks() {
        import_block(source, target, nested)?;
    }
    Ok(())
}
