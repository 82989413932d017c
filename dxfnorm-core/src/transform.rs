//! 块参照的放置变换：块内坐标先减去基点，再依次缩放、旋转、平移到插入点。

use std::f64::consts::{FRAC_PI_2, TAU};

use glam::{DAffine2, DVec2};

use crate::document::{
    Arc, Attribute, BlockReference, Circle, Ellipse, Entity, EntityAttributes, Line, MText,
    Polyline, PolylineVertex, RasterImage, RevisionCloud, Text,
};
use crate::errors::DocumentError;
use crate::geometry::{Point2, Vector2};

const SCALE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub struct InsertTransform {
    affine: DAffine2,
    scale: DVec2,
    rotation: f64,
}

impl InsertTransform {
    pub fn new(reference: &BlockReference, base_point: Point2) -> Self {
        let scale = reference.scale.as_vec2();
        let affine = DAffine2::from_scale_angle_translation(
            scale,
            reference.rotation,
            reference.insert.as_vec2(),
        ) * DAffine2::from_translation(-base_point.as_vec2());
        Self {
            affine,
            scale,
            rotation: reference.rotation,
        }
    }

    #[inline]
    pub fn point(&self, point: Point2) -> Point2 {
        Point2::from_vec(self.affine.transform_point2(point.as_vec2()))
    }

    #[inline]
    pub fn vector(&self, vector: Vector2) -> Vector2 {
        Vector2(self.affine.transform_vector2(vector.as_vec2()))
    }

    /// X/Y 缩放绝对值相同（允许镜像）。
    pub fn is_uniform(&self) -> bool {
        let sx = self.scale.x.abs();
        let sy = self.scale.y.abs();
        (sx - sy).abs() <= SCALE_TOLERANCE * sx.max(sy).max(1.0)
    }

    #[inline]
    pub fn is_mirrored(&self) -> bool {
        self.scale.x * self.scale.y < 0.0
    }

    fn angle(&self, angle: f64) -> f64 {
        let direction = self.affine.transform_vector2(DVec2::from_angle(angle));
        direction.y.atan2(direction.x)
    }

    /// 对单个实体应用变换，返回新实体。
    pub fn apply(&self, entity: &Entity) -> Result<Entity, DocumentError> {
        let transformed = match entity {
            Entity::Line(line) => Entity::Line(Line {
                start: self.point(line.start),
                end: self.point(line.end),
                attrs: line.attrs.clone(),
            }),
            Entity::Circle(circle) => {
                if self.is_uniform() {
                    Entity::Circle(Circle {
                        center: self.point(circle.center),
                        radius: circle.radius * self.scale.x.abs(),
                        attrs: circle.attrs.clone(),
                    })
                } else {
                    Entity::Ellipse(self.circular_arc_to_ellipse(
                        circle.center,
                        circle.radius,
                        0.0,
                        TAU,
                        &circle.attrs,
                    ))
                }
            }
            Entity::Arc(arc) => {
                if self.is_uniform() {
                    let mut start = self.angle(arc.start_angle);
                    let mut end = self.angle(arc.end_angle);
                    if self.is_mirrored() {
                        std::mem::swap(&mut start, &mut end);
                    }
                    Entity::Arc(Arc {
                        center: self.point(arc.center),
                        radius: arc.radius * self.scale.x.abs(),
                        start_angle: normalize_angle(start),
                        end_angle: normalize_angle(end),
                        attrs: arc.attrs.clone(),
                    })
                } else {
                    Entity::Ellipse(self.circular_arc_to_ellipse(
                        arc.center,
                        arc.radius,
                        arc.start_angle,
                        arc.end_angle,
                        &arc.attrs,
                    ))
                }
            }
            Entity::Ellipse(ellipse) => {
                if !self.is_uniform() {
                    return Err(unsupported("ELLIPSE", "non-uniform scaling"));
                }
                let (start, end) = if self.is_mirrored() {
                    (-ellipse.end_parameter, -ellipse.start_parameter)
                } else {
                    (ellipse.start_parameter, ellipse.end_parameter)
                };
                let (start_parameter, end_parameter) = normalize_range(start, end);
                Entity::Ellipse(Ellipse {
                    center: self.point(ellipse.center),
                    major_axis: self.vector(ellipse.major_axis),
                    ratio: ellipse.ratio,
                    start_parameter,
                    end_parameter,
                    attrs: ellipse.attrs.clone(),
                })
            }
            Entity::Polyline(polyline) => Entity::Polyline(Polyline {
                vertices: self.vertices(&polyline.vertices, "LWPOLYLINE")?,
                is_closed: polyline.is_closed,
                attrs: polyline.attrs.clone(),
            }),
            Entity::RevisionCloud(cloud) => Entity::RevisionCloud(RevisionCloud {
                vertices: self.vertices(&cloud.vertices, "REVCLOUD")?,
                segment_length: cloud.segment_length * self.scale.x.abs(),
                attrs: cloud.attrs.clone(),
            }),
            Entity::Text(text) => Entity::Text(Text {
                insert: self.point(text.insert),
                content: text.content.clone(),
                height: text.height * self.scale.y.abs(),
                rotation: self.angle(text.rotation),
                style: text.style.clone(),
                attrs: text.attrs.clone(),
            }),
            Entity::MText(mtext) => {
                let direction = self.vector(mtext.direction).as_vec2();
                let direction = direction.try_normalize().unwrap_or(DVec2::X);
                Entity::MText(MText {
                    insert: self.point(mtext.insert),
                    content: mtext.content.clone(),
                    height: mtext.height * self.scale.y.abs(),
                    reference_width: mtext.reference_width.map(|w| w * self.scale.x.abs()),
                    direction: Vector2(direction),
                    attachment_point: mtext.attachment_point,
                    style: mtext.style.clone(),
                    attrs: mtext.attrs.clone(),
                })
            }
            Entity::BlockReference(reference) => Entity::BlockReference(self.nested(reference)?),
            Entity::RasterImage(image) => Entity::RasterImage(RasterImage {
                image_def_handle: image.image_def_handle.clone(),
                insert: self.point(image.insert),
                u_vector: self.vector(image.u_vector),
                v_vector: self.vector(image.v_vector),
                image_size: image.image_size,
                attrs: image.attrs.clone(),
            }),
            Entity::Raw(raw) => {
                return Err(unsupported("RAW", &format!("{} has no geometry model", raw.kind)));
            }
        };
        Ok(transformed)
    }

    fn vertices(
        &self,
        vertices: &[PolylineVertex],
        kind: &'static str,
    ) -> Result<Vec<PolylineVertex>, DocumentError> {
        let has_arcs = vertices.iter().any(|vertex| vertex.bulge != 0.0);
        if has_arcs && !self.is_uniform() {
            return Err(unsupported(kind, "non-uniform scaling of arc segments"));
        }
        let sign = if self.is_mirrored() { -1.0 } else { 1.0 };
        Ok(vertices
            .iter()
            .map(|vertex| PolylineVertex::with_bulge(self.point(vertex.position), vertex.bulge * sign))
            .collect())
    }

    fn nested(&self, reference: &BlockReference) -> Result<BlockReference, DocumentError> {
        let (scale, rotation) = if self.is_uniform() && !self.is_mirrored() {
            let factor = self.scale.x.abs();
            (
                Vector2::new(reference.scale.x() * factor, reference.scale.y() * factor),
                reference.rotation + self.rotation,
            )
        } else if self.rotation == 0.0 && reference.rotation == 0.0 {
            (
                Vector2::new(
                    reference.scale.x() * self.scale.x,
                    reference.scale.y() * self.scale.y,
                ),
                0.0,
            )
        } else {
            return Err(unsupported(
                "INSERT",
                "rotated nested reference under non-uniform or mirrored scaling",
            ));
        };
        let attributes = reference
            .attributes
            .iter()
            .map(|attribute| Attribute {
                tag: attribute.tag.clone(),
                text: attribute.text.clone(),
                insert: self.point(attribute.insert),
                height: attribute.height * self.scale.y.abs(),
                rotation: self.angle(attribute.rotation),
                style: attribute.style.clone(),
                attrs: attribute.attrs.clone(),
            })
            .collect();
        Ok(BlockReference {
            name: reference.name.clone(),
            insert: self.point(reference.insert),
            scale,
            rotation,
            attributes,
            attrs: reference.attrs.clone(),
        })
    }

    /// 非等比缩放下的圆/圆弧转换为椭圆。
    /// 变换后 p(t) = c' + cos(t)·U + sin(t)·V，U ⟂ V（缩放后再旋转保证正交）。
    fn circular_arc_to_ellipse(
        &self,
        center: Point2,
        radius: f64,
        start: f64,
        end: f64,
        attrs: &EntityAttributes,
    ) -> Ellipse {
        let u = self.affine.transform_vector2(DVec2::new(radius, 0.0));
        let v = self.affine.transform_vector2(DVec2::new(0.0, radius));
        let counter_clockwise = u.perp_dot(v) > 0.0;
        let (major, ratio, shift) = if u.length() >= v.length() {
            (u, v.length() / u.length(), 0.0)
        } else {
            (v, u.length() / v.length(), FRAC_PI_2)
        };
        let (start, end) = if counter_clockwise {
            (start - shift, end - shift)
        } else {
            (-(end - shift), -(start - shift))
        };
        let (start_parameter, end_parameter) = normalize_range(start, end);
        Ellipse {
            center: self.point(center),
            major_axis: Vector2(major),
            ratio,
            start_parameter,
            end_parameter,
            attrs: attrs.clone(),
        }
    }
}

fn unsupported(kind: &'static str, reason: &str) -> DocumentError {
    DocumentError::UnsupportedTransform {
        kind,
        reason: reason.to_string(),
    }
}

fn normalize_angle(angle: f64) -> f64 {
    let mut result = angle % TAU;
    if result < 0.0 {
        result += TAU;
    }
    result
}

/// 起点归一到 [0, 2π)，保持跨度不变。
fn normalize_range(start: f64, end: f64) -> (f64, f64) {
    let span = end - start;
    let start = normalize_angle(start);
    (start, start + span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn reference(insert: Point2, scale: Vector2, rotation: f64) -> BlockReference {
        BlockReference {
            name: "B".to_string(),
            insert,
            scale,
            rotation,
            attributes: Vec::new(),
            attrs: EntityAttributes::on_layer("0"),
        }
    }

    fn assert_point(actual: Point2, x: f64, y: f64) {
        assert!(
            (actual.x() - x).abs() < 1e-9 && (actual.y() - y).abs() < 1e-9,
            "expected ({x}, {y}), got ({}, {})",
            actual.x(),
            actual.y()
        );
    }

    #[test]
    fn line_is_placed_relative_to_base_point() {
        let transform = InsertTransform::new(
            &reference(Point2::new(10.0, 0.0), Vector2::new(2.0, 2.0), FRAC_PI_2),
            Point2::new(1.0, 0.0),
        );
        let line = Entity::Line(Line {
            start: Point2::new(1.0, 0.0),
            end: Point2::new(2.0, 0.0),
            attrs: EntityAttributes::on_layer("0"),
        });
        match transform.apply(&line).unwrap() {
            Entity::Line(line) => {
                assert_point(line.start, 10.0, 0.0);
                assert_point(line.end, 10.0, 2.0);
            }
            other => panic!("unexpected entity {other:?}"),
        }
    }

    #[test]
    fn circle_under_non_uniform_scale_becomes_ellipse() {
        let transform = InsertTransform::new(
            &reference(Point2::new(0.0, 0.0), Vector2::new(2.0, 1.0), 0.0),
            Point2::new(0.0, 0.0),
        );
        let circle = Entity::Circle(Circle {
            center: Point2::new(1.0, 1.0),
            radius: 1.0,
            attrs: EntityAttributes::on_layer("0"),
        });
        match transform.apply(&circle).unwrap() {
            Entity::Ellipse(ellipse) => {
                assert_point(ellipse.center, 2.0, 1.0);
                assert!((ellipse.major_axis.x() - 2.0).abs() < 1e-9);
                assert!((ellipse.ratio - 0.5).abs() < 1e-9);
                assert!((ellipse.end_parameter - ellipse.start_parameter - TAU).abs() < 1e-9);
            }
            other => panic!("unexpected entity {other:?}"),
        }
    }

    #[test]
    fn mirrored_arc_swaps_end_points() {
        let transform = InsertTransform::new(
            &reference(Point2::new(0.0, 0.0), Vector2::new(-1.0, 1.0), 0.0),
            Point2::new(0.0, 0.0),
        );
        let arc = Entity::Arc(Arc {
            center: Point2::new(0.0, 0.0),
            radius: 1.0,
            start_angle: 0.0,
            end_angle: FRAC_PI_2,
            attrs: EntityAttributes::on_layer("0"),
        });
        match transform.apply(&arc).unwrap() {
            Entity::Arc(arc) => {
                assert!((arc.start_angle - FRAC_PI_2).abs() < 1e-9);
                assert!((arc.end_angle - PI).abs() < 1e-9);
            }
            other => panic!("unexpected entity {other:?}"),
        }
    }

    #[test]
    fn mirrored_polyline_flips_bulges() {
        let transform = InsertTransform::new(
            &reference(Point2::new(0.0, 0.0), Vector2::new(1.0, -1.0), 0.0),
            Point2::new(0.0, 0.0),
        );
        let polyline = Entity::Polyline(Polyline {
            vertices: vec![
                PolylineVertex::with_bulge(Point2::new(0.0, 0.0), 1.0),
                PolylineVertex::new(Point2::new(2.0, 0.0)),
            ],
            is_closed: false,
            attrs: EntityAttributes::on_layer("0"),
        });
        match transform.apply(&polyline).unwrap() {
            Entity::Polyline(polyline) => {
                assert!((polyline.vertices[0].bulge + 1.0).abs() < 1e-9);
                assert_point(polyline.vertices[1].position, 2.0, 0.0);
            }
            other => panic!("unexpected entity {other:?}"),
        }
    }

    #[test]
    fn non_uniform_scale_rejects_bulged_polyline() {
        let transform = InsertTransform::new(
            &reference(Point2::new(0.0, 0.0), Vector2::new(1.0, 3.0), 0.0),
            Point2::new(0.0, 0.0),
        );
        let polyline = Entity::Polyline(Polyline {
            vertices: vec![
                PolylineVertex::with_bulge(Point2::new(0.0, 0.0), 0.5),
                PolylineVertex::new(Point2::new(2.0, 0.0)),
            ],
            is_closed: false,
            attrs: EntityAttributes::on_layer("0"),
        });
        assert!(matches!(
            transform.apply(&polyline),
            Err(DocumentError::UnsupportedTransform { kind: "LWPOLYLINE", .. })
        ));
    }

    #[test]
    fn nested_reference_accumulates_rotation_and_scale() {
        let transform = InsertTransform::new(
            &reference(Point2::new(5.0, 5.0), Vector2::new(2.0, 2.0), FRAC_PI_2),
            Point2::new(0.0, 0.0),
        );
        let inner = Entity::BlockReference(reference(
            Point2::new(1.0, 0.0),
            Vector2::new(1.0, 1.0),
            FRAC_PI_2,
        ));
        match transform.apply(&inner).unwrap() {
            Entity::BlockReference(nested) => {
                assert_point(nested.insert, 5.0, 7.0);
                assert!((nested.scale.x() - 2.0).abs() < 1e-9);
                assert!((nested.rotation - PI).abs() < 1e-9);
            }
            other => panic!("unexpected entity {other:?}"),
        }
    }
}
