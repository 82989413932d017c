pub mod document;
pub mod remap;
pub mod transform;

pub mod geometry {
    use glam::DVec2;
    use serde::{Deserialize, Serialize};

    /// 二维点，内部以 `glam::DVec2` 表示，与 DXF 的双精度坐标保持一致。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_vec(vec: DVec2) -> Self {
            Self(vec)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn translate(self, offset: Vector2) -> Self {
            Self(self.0 + offset.0)
        }

        #[inline]
        pub fn vector_to(self, other: Point2) -> Vector2 {
            Vector2(other.0 - self.0)
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }

        /// 在容差范围内判断两点是否重合。
        #[inline]
        pub fn is_close(self, other: Point2, tolerance: f64) -> bool {
            self.0.distance_squared(other.0) <= tolerance * tolerance
        }
    }

    impl From<DVec2> for Point2 {
        fn from(value: DVec2) -> Self {
            Self::from_vec(value)
        }
    }

    /// 二维向量。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector2(pub DVec2);

    impl Vector2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_points(start: Point2, end: Point2) -> Self {
            Self(end.0 - start.0)
        }

        #[inline]
        pub fn length(self) -> f64 {
            self.0.length()
        }

        #[inline]
        pub fn length_squared(self) -> f64 {
            self.0.length_squared()
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }
    }

    impl From<DVec2> for Vector2 {
        fn from(value: DVec2) -> Self {
            Self(value)
        }
    }

    /// 计算多边形的有向面积（鞋带公式），逆时针为正。首尾无需重复。
    pub fn signed_area(points: &[Point2]) -> f64 {
        if points.len() < 3 {
            return 0.0;
        }
        let mut twice_area = 0.0;
        for (index, current) in points.iter().enumerate() {
            let next = points[(index + 1) % points.len()];
            twice_area += current.x() * next.y() - next.x() * current.y();
        }
        twice_area * 0.5
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn signed_area_follows_orientation() {
            let ccw = [
                Point2::new(0.0, 0.0),
                Point2::new(4.0, 0.0),
                Point2::new(4.0, 3.0),
                Point2::new(0.0, 3.0),
            ];
            assert!((signed_area(&ccw) - 12.0).abs() < 1e-9);

            let mut cw = ccw;
            cw.reverse();
            assert!((signed_area(&cw) + 12.0).abs() < 1e-9);
            assert_eq!(signed_area(&ccw[..2]), 0.0);
        }
    }
}

pub mod errors {
    use thiserror::Error;

    /// 文档模型层面的错误，调用方按需决定是跳过单个对象还是放弃整份文档。
    #[derive(Debug, Error)]
    pub enum DocumentError {
        #[error("invalid {kind} name {name:?}")]
        InvalidName { kind: &'static str, name: String },
        #[error("layer {0:?} cannot be removed")]
        LayerProtected(String),
        #[error("layer {0:?} does not exist")]
        UnknownLayer(String),
        #[error("block {0:?} is a layout container and cannot be removed")]
        BlockProtected(String),
        #[error("block {name:?} is still referenced by {referenced_by}")]
        BlockInUse { name: String, referenced_by: String },
        #[error("block {0:?} is not defined")]
        UnknownBlock(String),
        #[error("image definition {0:?} is not defined")]
        UnknownImageDefinition(String),
        #[error("sheet {0:?} does not exist")]
        UnknownSheet(String),
        #[error("sheet {0:?} already exists")]
        DuplicateSheet(String),
        #[error("cannot transform {kind}: {reason}")]
        UnsupportedTransform { kind: &'static str, reason: String },
    }

    /// 映射表单元格与列类型不符。
    #[derive(Debug, Error)]
    pub enum RemapError {
        #[error("remap row {row} ({layer:?}), column {column}: {reason}")]
        InvalidCell {
            row: usize,
            layer: String,
            column: &'static str,
            reason: String,
        },
    }
}
