//! 图层映射表的数据模型：原始表格行（单元格类型宽松）与补齐默认值后的映射行。

use serde::{Deserialize, Serialize};

use crate::document::COLOR_BYLAYER;
use crate::errors::RemapError;

pub const DEFAULT_DEST_LAYER: &str = "fallback";
pub const DEFAULT_DEST_COLOR: i16 = COLOR_BYLAYER;
pub const DEFAULT_DEST_LINEWEIGHT: f64 = 0.0;
pub const DEFAULT_DEST_LINETYPE: &str = "continuous";
/// 图层线宽存储值（`round(weight * 10)`）的上限，即 DXF 组码 370 的最大值。
pub const MAX_LINEWEIGHT: i16 = 211;

/// 表格单元格。表格来源允许整数、浮点与文本混用，按列在使用时校验。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TableCell {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl TableCell {
    /// 空文本视为缺失值。
    fn present(cell: &Option<TableCell>) -> Option<&TableCell> {
        match cell {
            Some(TableCell::Text(text)) if text.trim().is_empty() => None,
            Some(cell) => Some(cell),
            None => None,
        }
    }

    fn as_text(&self) -> String {
        match self {
            TableCell::Integer(value) => value.to_string(),
            TableCell::Float(value) if value.fract() == 0.0 && value.is_finite() => {
                format!("{}", *value as i64)
            }
            TableCell::Float(value) => value.to_string(),
            TableCell::Text(text) => text.trim().to_string(),
        }
    }
}

/// 映射表原始行，字段名与表头一致。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemapEntry {
    #[serde(rename = "currentLayer")]
    pub current_layer: TableCell,
    #[serde(rename = "newLayer", default, skip_serializing_if = "Option::is_none")]
    pub new_layer: Option<TableCell>,
    #[serde(rename = "colorID", default, skip_serializing_if = "Option::is_none")]
    pub color_id: Option<TableCell>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineweight: Option<TableCell>,
    #[serde(rename = "lineType", default, skip_serializing_if = "Option::is_none")]
    pub line_type: Option<TableCell>,
}

impl RemapEntry {
    /// 仅指定源图层、其余列留空的行。
    pub fn for_layer(layer: impl Into<String>) -> Self {
        Self {
            current_layer: TableCell::Text(layer.into()),
            new_layer: None,
            color_id: None,
            lineweight: None,
            line_type: None,
        }
    }

    pub fn source_layer(&self) -> String {
        self.current_layer.as_text()
    }

    /// 按列补齐默认值并校验类型；`row` 为表内序号，仅用于错误信息。
    pub fn resolve(&self, row: usize) -> Result<RemapRow, RemapError> {
        let layer = self.source_layer();
        let invalid = |column: &'static str, reason: String| RemapError::InvalidCell {
            row,
            layer: layer.clone(),
            column,
            reason,
        };

        let dest_layer = TableCell::present(&self.new_layer)
            .map(TableCell::as_text)
            .unwrap_or_else(|| DEFAULT_DEST_LAYER.to_string());

        let color = match TableCell::present(&self.color_id) {
            None => DEFAULT_DEST_COLOR,
            Some(cell) => {
                let value = match cell {
                    TableCell::Integer(value) => *value,
                    TableCell::Float(value) if value.fract() == 0.0 && value.is_finite() => {
                        *value as i64
                    }
                    TableCell::Float(value) => {
                        return Err(invalid("colorID", format!("{value} is not an integer")));
                    }
                    TableCell::Text(text) => text.trim().parse::<i64>().map_err(|_| {
                        invalid("colorID", format!("{text:?} is not an integer"))
                    })?,
                };
                if !(0..=256).contains(&value) {
                    return Err(invalid("colorID", format!("{value} is outside 0..=256")));
                }
                value as i16
            }
        };

        let lineweight = match TableCell::present(&self.lineweight) {
            None => DEFAULT_DEST_LINEWEIGHT,
            Some(cell) => {
                let value = match cell {
                    TableCell::Integer(value) => *value as f64,
                    TableCell::Float(value) => *value,
                    TableCell::Text(text) => text.trim().parse::<f64>().map_err(|_| {
                        invalid("lineweight", format!("{text:?} is not a number"))
                    })?,
                };
                if !value.is_finite() || value < 0.0 {
                    return Err(invalid(
                        "lineweight",
                        format!("{value} is not a non-negative number"),
                    ));
                }
                if (value * 10.0).round() > f64::from(MAX_LINEWEIGHT) {
                    return Err(invalid(
                        "lineweight",
                        format!("{value} is stored above the maximum lineweight {MAX_LINEWEIGHT}"),
                    ));
                }
                value
            }
        };

        let linetype = TableCell::present(&self.line_type)
            .map(TableCell::as_text)
            .unwrap_or_else(|| DEFAULT_DEST_LINETYPE.to_string());

        Ok(RemapRow {
            source_layer: layer.clone(),
            dest_layer,
            color,
            lineweight,
            linetype,
        })
    }
}

/// 补齐默认值后的映射行。`linetype` 仅作记录，不参与映射。
#[derive(Debug, Clone, PartialEq)]
pub struct RemapRow {
    pub source_layer: String,
    pub dest_layer: String,
    pub color: i16,
    pub lineweight: f64,
    pub linetype: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_row_uses_defaults() {
        let row = RemapEntry::for_layer("X").resolve(0).unwrap();
        assert_eq!(
            row,
            RemapRow {
                source_layer: "X".to_string(),
                dest_layer: "fallback".to_string(),
                color: 256,
                lineweight: 0.0,
                linetype: "continuous".to_string(),
            }
        );
    }

    #[test]
    fn blank_text_cells_count_as_missing() {
        let entry = RemapEntry {
            new_layer: Some(TableCell::Text("  ".to_string())),
            color_id: Some(TableCell::Text(String::new())),
            ..RemapEntry::for_layer("X")
        };
        let row = entry.resolve(3).unwrap();
        assert_eq!(row.dest_layer, "fallback");
        assert_eq!(row.color, 256);
    }

    #[test]
    fn numeric_cells_are_coerced_per_column() {
        let entry = RemapEntry {
            current_layer: TableCell::Integer(10),
            new_layer: Some(TableCell::Float(20.0)),
            color_id: Some(TableCell::Float(3.0)),
            lineweight: Some(TableCell::Text("0.35".to_string())),
            line_type: Some(TableCell::Text("DASHED".to_string())),
        };
        let row = entry.resolve(0).unwrap();
        assert_eq!(row.source_layer, "10");
        assert_eq!(row.dest_layer, "20");
        assert_eq!(row.color, 3);
        assert!((row.lineweight - 0.35).abs() < 1e-12);
        assert_eq!(row.linetype, "DASHED");
    }

    #[test]
    fn inconsistent_cells_are_reported_with_column() {
        let entry = RemapEntry {
            color_id: Some(TableCell::Text("red".to_string())),
            ..RemapEntry::for_layer("WALLS")
        };
        match entry.resolve(7).unwrap_err() {
            RemapError::InvalidCell {
                row, layer, column, ..
            } => {
                assert_eq!(row, 7);
                assert_eq!(layer, "WALLS");
                assert_eq!(column, "colorID");
            }
        }

        let negative = RemapEntry {
            lineweight: Some(TableCell::Float(-1.0)),
            ..RemapEntry::for_layer("WALLS")
        };
        assert!(negative.resolve(0).is_err());

        let fractional_color = RemapEntry {
            color_id: Some(TableCell::Float(2.5)),
            ..RemapEntry::for_layer("WALLS")
        };
        assert!(fractional_color.resolve(0).is_err());
    }

    #[test]
    fn lineweight_above_dxf_maximum_is_rejected() {
        let widest = RemapEntry {
            lineweight: Some(TableCell::Float(21.1)),
            ..RemapEntry::for_layer("WALLS")
        };
        assert_eq!(widest.resolve(0).unwrap().lineweight, 21.1);

        let huge = RemapEntry {
            lineweight: Some(TableCell::Float(1.0e6)),
            ..RemapEntry::for_layer("WALLS")
        };
        match huge.resolve(3).unwrap_err() {
            RemapError::InvalidCell { row, column, .. } => {
                assert_eq!(row, 3);
                assert_eq!(column, "lineweight");
            }
        }

        let text = RemapEntry {
            lineweight: Some(TableCell::Text("21.2".to_string())),
            ..RemapEntry::for_layer("WALLS")
        };
        assert!(text.resolve(0).is_err(), "21.2 存储为 212，超过 211");
    }
}
