use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use walkdir::WalkDir;

use crate::IoError;

static SHEET_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)_(\d+)\.dxf$").expect("sheet suffix regex"));

fn is_drawing(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("dxf"))
}

/// 列出目录（不递归）中的 `.dxf` 文件，按文件名排序。
pub fn list_drawings(dir: &Path) -> Result<Vec<PathBuf>, IoError> {
    let mut drawings = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|source| IoError::ListError {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_file() && is_drawing(entry.path()) {
            drawings.push(entry.into_path());
        }
    }
    drawings.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(drawings)
}

/// 文件名末尾 `_<数字>.dxf` 中的数字。
pub fn sheet_suffix(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    SHEET_SUFFIX
        .captures(name)
        .and_then(|captures| captures.get(1))
        .and_then(|digits| digits.as_str().parse().ok())
}

/// 按图号后缀升序排列；无后缀的文件排在最后并保持原顺序。
pub fn sort_by_sheet_suffix(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort_by_key(|path| match sheet_suffix(path) {
        Some(number) => (0u8, number),
        None => (1u8, 0),
    });
    paths
}
