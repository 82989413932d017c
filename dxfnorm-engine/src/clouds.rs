//! 由闭合多段线边界重建修订云线。

use dxfnorm_core::document::{Document, Entity, EntityAttributes, EntityId, PolylineVertex, RevisionCloud, Space};
use dxfnorm_core::geometry::{Point2, signed_area};
use tracing::{debug, info};

use crate::errors::EngineError;

pub const DEFAULT_SEGMENT_LENGTH: f64 = 6.0;
/// 每段弧的凸度绝对值，对应约 106° 的圆心角。
pub const CLOUD_BULGE: f64 = 0.5;

const MIN_SEGMENT_LENGTH: f64 = 1e-6;
const DEGENERATE_EDGE: f64 = 1e-9;

fn validate_segment_length(segment_length: f64) -> Result<(), EngineError> {
    if !segment_length.is_finite() || segment_length <= MIN_SEGMENT_LENGTH {
        return Err(EngineError::InvalidSegmentLength(segment_length));
    }
    Ok(())
}

/// 沿边界生成云线顶点：每条边按 `ceil(边长 / segment_length)` 等分，
/// 各顶点凸度取 ±0.5，符号随边界方向使弧线向外凸出。长度为零的边被忽略。
pub fn cloud_vertices(
    boundary: &[Point2],
    segment_length: f64,
) -> Result<Vec<PolylineVertex>, EngineError> {
    validate_segment_length(segment_length)?;
    let bulge = if signed_area(boundary) >= 0.0 {
        CLOUD_BULGE
    } else {
        -CLOUD_BULGE
    };

    let mut vertices = Vec::new();
    for (index, start) in boundary.iter().enumerate() {
        let end = boundary[(index + 1) % boundary.len()];
        let edge = start.vector_to(end);
        let length = edge.length();
        if length < DEGENERATE_EDGE {
            continue;
        }
        let pieces = (length / segment_length).ceil().max(1.0) as usize;
        for step in 0..pieces {
            let t = step as f64 / pieces as f64;
            let position = Point2::from_vec(start.as_vec2() + edge.as_vec2() * t);
            vertices.push(PolylineVertex::with_bulge(position, bulge));
        }
    }
    Ok(vertices)
}

#[derive(Debug, Clone, Default)]
pub struct CloudReport {
    /// 新生成的云线及其图层，按边界记录顺序。
    pub clouds: Vec<(EntityId, String)>,
}

impl CloudReport {
    #[inline]
    pub fn len(&self) -> usize {
        self.clouds.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clouds.is_empty()
    }
}

/// 将指定图层上的闭合多段线替换为修订云线。
///
/// 先摘除全部符合条件的边界，再逐个生成云线放回原图层；其它实体保持不变。
pub fn reconstruct_clouds(
    document: &mut Document,
    space: &Space,
    layers: &[String],
    segment_length: f64,
) -> Result<CloudReport, EngineError> {
    validate_segment_length(segment_length)?;
    let eligible = |entity: &Entity| {
        layers
            .iter()
            .any(|layer| layer.eq_ignore_ascii_case(entity.layer_name()))
            && entity.closed_boundary().is_some()
    };

    let removed = document.remove_entities_where(space, eligible)?;
    let boundaries: Vec<(Vec<Point2>, String)> = removed
        .into_iter()
        .filter_map(|(id, entity)| {
            debug!(entity = id.get(), layer = entity.layer_name(), "摘除云线边界");
            let layer = entity.layer_name().to_string();
            entity.closed_boundary().map(|points| (points, layer))
        })
        .collect();

    let mut report = CloudReport::default();
    for (points, layer) in boundaries {
        let vertices = cloud_vertices(&points, segment_length)?;
        let cloud = Entity::RevisionCloud(RevisionCloud {
            vertices,
            segment_length,
            attrs: EntityAttributes::on_layer(layer.clone()),
        });
        let id = document.add_entity_to(space, cloud)?;
        report.clouds.push((id, layer));
    }

    info!(space = %space, clouds = report.len(), "修订云线重建完成");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use dxfnorm_core::geometry::Vector2;

    use super::*;

    fn square(size: f64) -> Vec<Point2> {
        vec![
            Point2::new(0.0, 0.0),
            Point2::new(size, 0.0),
            Point2::new(size, size),
            Point2::new(0.0, size),
        ]
    }

    #[test]
    fn edges_are_split_by_segment_length() {
        let vertices = cloud_vertices(&square(12.0), 6.0).unwrap();
        assert_eq!(vertices.len(), 8);
        assert!(vertices[1].position.is_close(Point2::new(6.0, 0.0), 1e-9));
        assert!(vertices.iter().all(|vertex| (vertex.bulge - CLOUD_BULGE).abs() < 1e-12));

        // 13 / 6 向上取整为 3 段
        let uneven = cloud_vertices(&square(13.0), 6.0).unwrap();
        assert_eq!(uneven.len(), 12);
    }

    #[test]
    fn short_edges_still_produce_one_arc() {
        let vertices = cloud_vertices(&square(1.0), 6.0).unwrap();
        assert_eq!(vertices.len(), 4);
    }

    #[test]
    fn clockwise_boundary_flips_bulge() {
        let mut points = square(6.0);
        points.reverse();
        let vertices = cloud_vertices(&points, 6.0).unwrap();
        assert!(vertices.iter().all(|vertex| (vertex.bulge + CLOUD_BULGE).abs() < 1e-12));
    }

    #[test]
    fn invalid_segment_length_is_rejected() {
        for length in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                cloud_vertices(&square(1.0), length),
                Err(EngineError::InvalidSegmentLength(_))
            ));
        }
    }

    #[test]
    fn reconstruction_replaces_only_eligible_closed_boundaries() {
        let mut doc = Document::new();
        let a = doc.add_polyline(square(12.0), true, "CLOUD");
        let open = doc.add_polyline(square(12.0), false, "CLOUD");
        let line = doc.add_line(Point2::new(0.0, 0.0), Point2::new(1.0, 1.0), "CLOUD");
        let other = doc.add_polyline(square(12.0), true, "WALLS");
        let b = doc.add_polyline(
            square(3.0).into_iter().map(|p| p.translate(Vector2::new(20.0, 0.0))),
            true,
            "cloud",
        );

        let report =
            reconstruct_clouds(&mut doc, &Space::Model, &["CLOUD".to_string()], 6.0).unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report.clouds[0].1, "CLOUD");
        assert_eq!(report.clouds[1].1, "cloud");

        assert!(doc.entity(a).is_none());
        assert!(doc.entity(b).is_none());
        for id in [open, line, other] {
            assert!(doc.entity(id).is_some());
        }
        let clouds: Vec<_> = doc
            .entities()
            .filter_map(|(_, entity)| match entity {
                Entity::RevisionCloud(cloud) => Some(cloud),
                _ => None,
            })
            .collect();
        assert_eq!(clouds.len(), 2);
        assert_eq!(clouds[0].vertices.len(), 8);
        assert_eq!(clouds[1].vertices.len(), 4);

        // 云线不是闭合多段线，再次执行不会改变数量
        let again =
            reconstruct_clouds(&mut doc, &Space::Model, &["CLOUD".to_string()], 6.0).unwrap();
        assert!(again.is_empty());
        assert_eq!(doc.entities().count(), 5);
    }

    #[test]
    fn invalid_length_leaves_document_untouched() {
        let mut doc = Document::new();
        doc.add_polyline(square(12.0), true, "CLOUD");
        assert!(reconstruct_clouds(&mut doc, &Space::Model, &["CLOUD".to_string()], 0.0).is_err());
        assert_eq!(doc.entities().count(), 1);
    }
}
