use dxfnorm_core::document::{Document, Entity, EntityId, Space};
use tracing::{debug, info};

use crate::errors::EngineError;

/// 嵌套块参照逐轮炸开的默认轮数上限。
pub const DEFAULT_PASS_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExplodeReport {
    pub passes: usize,
    pub exploded: usize,
}

fn reference_ids(document: &Document) -> Vec<EntityId> {
    document
        .entities()
        .filter(|(_, entity)| matches!(entity, Entity::BlockReference(_)))
        .map(|(id, _)| *id)
        .collect()
}

/// 反复炸开模型空间中的块参照，直到不再存在块参照。
///
/// 炸开结果追加到模型空间末尾，原参照被删除。超过 `pass_limit` 轮仍有
/// 块参照（自引用的块）时返回 `ExplodeLimitExceeded`。
pub fn explode_all(document: &mut Document, pass_limit: usize) -> Result<ExplodeReport, EngineError> {
    let mut report = ExplodeReport::default();
    loop {
        let pending = reference_ids(document);
        if pending.is_empty() {
            break;
        }
        if report.passes >= pass_limit {
            return Err(EngineError::ExplodeLimitExceeded {
                passes: report.passes,
                remaining: pending.len(),
            });
        }
        for id in pending {
            let Some(Entity::BlockReference(reference)) = document.entity(id) else {
                continue;
            };
            let reference = reference.clone();
            let exploded = document.explode_reference(&reference)?;
            document.remove_entity(&Space::Model, id);
            debug!(
                block = %reference.name,
                entity = id.get(),
                count = exploded.len(),
                "已炸开块参照"
            );
            for entity in exploded {
                document.add_entity(entity);
            }
            report.exploded += 1;
        }
        report.passes += 1;
    }
    info!(passes = report.passes, exploded = report.exploded, "块参照炸开完成");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use dxfnorm_core::document::{BlockDefinition, BlockReference, EntityAttributes, Line};
    use dxfnorm_core::errors::DocumentError;
    use dxfnorm_core::geometry::{Point2, Vector2};

    use super::*;

    fn insert(name: &str, at: Point2) -> Entity {
        Entity::BlockReference(BlockReference {
            name: name.to_string(),
            insert: at,
            scale: Vector2::new(1.0, 1.0),
            rotation: 0.0,
            attributes: Vec::new(),
            attrs: EntityAttributes::on_layer("REF"),
        })
    }

    fn unit_line(layer: &str) -> Entity {
        Entity::Line(Line {
            start: Point2::new(0.0, 0.0),
            end: Point2::new(1.0, 0.0),
            attrs: EntityAttributes::on_layer(layer),
        })
    }

    #[test]
    fn nested_references_are_fully_exploded() {
        let mut doc = Document::new();
        let mut inner = BlockDefinition::new("INNER");
        inner.entities.push(unit_line("0"));
        let mut outer = BlockDefinition::new("OUTER");
        outer.entities.push(insert("INNER", Point2::new(10.0, 0.0)));
        outer.entities.push(unit_line("GEOM"));
        doc.add_block_definition(inner);
        doc.add_block_definition(outer);
        doc.add_entity(insert("OUTER", Point2::new(100.0, 0.0)));

        let report = explode_all(&mut doc, DEFAULT_PASS_LIMIT).unwrap();
        assert_eq!(report.passes, 2);
        assert_eq!(report.exploded, 2);
        assert_eq!(doc.entities().count(), 2);

        let mut starts: Vec<(f64, String)> = doc
            .entities()
            .map(|(_, entity)| match entity {
                Entity::Line(line) => (line.start.x(), line.attrs.layer.clone()),
                other => panic!("unexpected entity {other:?}"),
            })
            .collect();
        starts.sort_by(|a, b| a.0.total_cmp(&b.0));
        assert!((starts[0].0 - 100.0).abs() < 1e-9);
        assert_eq!(starts[0].1, "GEOM");
        assert!((starts[1].0 - 110.0).abs() < 1e-9);
        // 0 层实体逐级继承参照图层
        assert_eq!(starts[1].1, "REF");
    }

    #[test]
    fn self_referencing_block_hits_pass_limit() {
        let mut doc = Document::new();
        let mut looped = BlockDefinition::new("LOOP");
        looped.entities.push(insert("LOOP", Point2::new(1.0, 0.0)));
        doc.add_block_definition(looped);
        doc.add_entity(insert("LOOP", Point2::new(0.0, 0.0)));

        let err = explode_all(&mut doc, 4).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ExplodeLimitExceeded { passes: 4, remaining: 1 }
        ));
    }

    #[test]
    fn missing_block_definition_is_an_error() {
        let mut doc = Document::new();
        doc.add_entity(insert("GHOST", Point2::new(0.0, 0.0)));
        let err = explode_all(&mut doc, DEFAULT_PASS_LIMIT).unwrap_err();
        assert!(matches!(err, EngineError::Document(DocumentError::UnknownBlock(_))));
    }

    #[test]
    fn document_without_references_needs_no_pass() {
        let mut doc = Document::new();
        doc.add_entity(unit_line("A"));
        assert_eq!(
            explode_all(&mut doc, DEFAULT_PASS_LIMIT).unwrap(),
            ExplodeReport::default()
        );
    }
}
