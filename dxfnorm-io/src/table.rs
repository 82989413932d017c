//! 图层映射表加载：按扩展名选择 TOML（`[[rows]]`）或 JSON（对象数组）。

use std::fs;
use std::path::Path;

use dxfnorm_core::remap::RemapEntry;
use serde::Deserialize;

use crate::IoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Toml,
    Json,
}

impl TableFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?;
        if extension.eq_ignore_ascii_case("toml") {
            Some(Self::Toml)
        } else if extension.eq_ignore_ascii_case("json") {
            Some(Self::Json)
        } else {
            None
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TomlTable {
    #[serde(default)]
    rows: Vec<RemapEntry>,
}

/// 解析映射表文本。单元格只做结构解析，类型校验推迟到行被选中时。
pub fn parse_remap_table(text: &str, format: TableFormat) -> Result<Vec<RemapEntry>, String> {
    match format {
        TableFormat::Toml => toml::from_str::<TomlTable>(text)
            .map(|table| table.rows)
            .map_err(|err| err.to_string()),
        TableFormat::Json => {
            serde_json::from_str::<Vec<RemapEntry>>(text).map_err(|err| err.to_string())
        }
    }
}

pub fn load_remap_table(path: &Path) -> Result<Vec<RemapEntry>, IoError> {
    let format = TableFormat::from_path(path).ok_or_else(|| IoError::InvalidTable {
        path: path.to_path_buf(),
        message: "仅支持 .toml 或 .json 映射表".to_string(),
    })?;
    let text = fs::read_to_string(path).map_err(|source| IoError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    parse_remap_table(&text, format).map_err(|message| IoError::InvalidTable {
        path: path.to_path_buf(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use dxfnorm_core::remap::TableCell;

    use super::*;

    #[test]
    fn format_follows_extension() {
        assert_eq!(TableFormat::from_path(Path::new("map.TOML")), Some(TableFormat::Toml));
        assert_eq!(TableFormat::from_path(Path::new("map.json")), Some(TableFormat::Json));
        assert_eq!(TableFormat::from_path(Path::new("map.xlsx")), None);
        assert_eq!(TableFormat::from_path(Path::new("map")), None);
    }

    #[test]
    fn toml_rows_keep_table_order_and_loose_cells() {
        let text = r#"
[[rows]]
currentLayer = "WALLS"
newLayer = "A-WALL"
colorID = 3
lineweight = 0.35

[[rows]]
currentLayer = 120
lineType = "dashed"
"#;
        let rows = parse_remap_table(text, TableFormat::Toml).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].source_layer(), "WALLS");
        assert_eq!(rows[0].color_id, Some(TableCell::Integer(3)));
        assert_eq!(rows[0].lineweight, Some(TableCell::Float(0.35)));
        assert_eq!(rows[1].source_layer(), "120");
        assert!(rows[1].new_layer.is_none());
    }

    #[test]
    fn json_array_is_accepted() {
        let text = r#"[{"currentLayer": "X", "colorID": "7"}, {"currentLayer": "Y"}]"#;
        let rows = parse_remap_table(text, TableFormat::Json).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].color_id, Some(TableCell::Text("7".to_string())));
        assert_eq!(rows[0].resolve(0).unwrap().color, 7);
    }

    #[test]
    fn missing_rows_key_yields_empty_table() {
        assert!(parse_remap_table("", TableFormat::Toml).unwrap().is_empty());
    }

    #[test]
    fn malformed_text_is_reported() {
        assert!(parse_remap_table("[[rows]]\nnewLayer = \"A\"\n", TableFormat::Toml).is_err());
        assert!(parse_remap_table("{", TableFormat::Json).is_err());
    }
}
