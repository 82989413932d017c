//! 多图纸合并导出：每个输入文件的模型空间复制到合并文档的一张图纸 `FL<i>`。

use std::path::{Path, PathBuf};

use dxfnorm_core::document::{Document, Space};
use dxfnorm_engine::errors::EngineError;
use dxfnorm_engine::merge::{MergeReport, merge_into, merge_layers};
use dxfnorm_engine::report::PassReport;
use dxfnorm_io::{DocumentLoader, DocumentSaver, list_drawings, sort_by_sheet_suffix};
use tracing::{error, info};

use crate::errors::BatchError;
use crate::runner::BatchRunner;

/// 第 `index` 个文件（从 0 计）对应的图纸名。
pub fn sheet_name(index: usize) -> String {
    format!("FL{}", index + 1)
}

#[derive(Debug, Clone)]
pub enum SheetStatus {
    Merged { layers: PassReport, merge: MergeReport },
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct SheetOutcome {
    pub sheet: String,
    pub input: PathBuf,
    pub status: SheetStatus,
}

#[derive(Debug, Clone)]
pub struct CombineReport {
    pub output: PathBuf,
    pub sheets: Vec<SheetOutcome>,
}

impl CombineReport {
    pub fn merged_count(&self) -> usize {
        self.sheets
            .iter()
            .filter(|sheet| matches!(sheet.status, SheetStatus::Merged { .. }))
            .count()
    }
}

impl<L: DocumentLoader, S: DocumentSaver> BatchRunner<L, S> {
    /// 合并目录中的全部 `.dxf` 文件。
    pub fn combine_dir(&self, input_dir: &Path, output: &Path) -> Result<CombineReport, BatchError> {
        let drawings = list_drawings(input_dir)?;
        self.combine(drawings, output)
    }

    /// 按图号后缀排序后依次合并。图纸 `FL1..N` 预先全部创建，读取失败的文件对应的图纸保持为空。
    pub fn combine(&self, files: Vec<PathBuf>, output: &Path) -> Result<CombineReport, BatchError> {
        let ordered = sort_by_sheet_suffix(files);
        let mut combined = Document::new();
        let sheets: Vec<String> = (0..ordered.len()).map(sheet_name).collect();
        for sheet in &sheets {
            combined
                .add_sheet(sheet.as_str())
                .map_err(EngineError::from)?;
        }

        let mut report = CombineReport {
            output: output.to_path_buf(),
            sheets: Vec::with_capacity(ordered.len()),
        };
        for (input, sheet) in ordered.into_iter().zip(sheets) {
            let status = match self.combine_one(&input, &mut combined, &sheet) {
                Ok((layers, merge)) => {
                    info!(
                        sheet = %sheet,
                        file = %input.display(),
                        entities = merge.entities.applied_count(),
                        "已合并到图纸"
                    );
                    SheetStatus::Merged { layers, merge }
                }
                Err(err) => {
                    error!(sheet = %sheet, file = %input.display(), error = %err, "合并图纸失败，已跳过");
                    SheetStatus::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            report.sheets.push(SheetOutcome {
                sheet,
                input,
                status,
            });
        }

        self.saver.save(&combined, output)?;
        info!(
            output = %output.display(),
            sheets = report.sheets.len(),
            merged = report.merged_count(),
            "合并文档已写出"
        );
        Ok(report)
    }

    fn combine_one(
        &self,
        input: &Path,
        combined: &mut Document,
        sheet: &str,
    ) -> Result<(PassReport, MergeReport), BatchError> {
        let source = self.loader.load(input)?;
        let layers = merge_layers(&source, combined);
        let merge = merge_into(&source, combined, &Space::Sheet(sheet.to_string()))?;
        Ok((layers, merge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheets_are_numbered_from_one() {
        assert_eq!(sheet_name(0), "FL1");
        assert_eq!(sheet_name(11), "FL12");
    }
}
