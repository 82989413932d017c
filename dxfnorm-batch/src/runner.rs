use std::path::{Path, PathBuf};

use dxfnorm_config::AppConfig;
use dxfnorm_core::document::Document;
use dxfnorm_core::remap::RemapEntry;
use dxfnorm_engine::pipeline::{NormalizeReport, PipelineOptions, normalize_document, prepare_logo};
use dxfnorm_io::{DocumentLoader, DocumentSaver, DxfFacade, list_drawings, load_remap_table};
use tracing::{error, info};

use crate::errors::BatchError;

/// 未配置输出目录时，结果写入输入目录下的该子目录。
pub const DEFAULT_OUTPUT_SUBDIR: &str = "adjusted";

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub logo_file: Option<PathBuf>,
    pub remap_table: Option<PathBuf>,
    pub options: PipelineOptions,
}

impl BatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let input_dir = config
            .paths
            .input_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let output_dir = config
            .paths
            .output_dir
            .clone()
            .unwrap_or_else(|| input_dir.join(DEFAULT_OUTPUT_SUBDIR));
        Self {
            input_dir,
            output_dir,
            logo_file: config.pipeline.logo_file.clone(),
            remap_table: config.pipeline.remap_table.clone(),
            options: PipelineOptions {
                cloud_layers: config.pipeline.cloud_layers.clone(),
                cloud_segment_length: config.pipeline.cloud_segment_length,
                explode_pass_limit: config.pipeline.explode_pass_limit,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum FileStatus {
    Normalized {
        output: PathBuf,
        report: NormalizeReport,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub input: PathBuf,
    pub status: FileStatus,
}

impl FileOutcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self.status, FileStatus::Normalized { .. })
    }

    pub fn file_name(&self) -> String {
        self.input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.input.display().to_string())
    }
}

/// 一次批处理的逐文件结果，顺序与处理顺序一致。
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub files: Vec<FileOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files.iter().filter(|outcome| outcome.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&FileOutcome, &str)> {
        self.files.iter().filter_map(|outcome| match &outcome.status {
            FileStatus::Failed { reason } => Some((outcome, reason.as_str())),
            FileStatus::Normalized { .. } => None,
        })
    }

    /// 成功写出的文件路径。
    pub fn outputs(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter_map(|outcome| match &outcome.status {
                FileStatus::Normalized { output, .. } => Some(output.clone()),
                FileStatus::Failed { .. } => None,
            })
            .collect()
    }
}

/// 批处理入口：逐个读取、规范化并写出图纸，单个文件失败不影响其它文件。
#[derive(Debug, Clone)]
pub struct BatchRunner<L = DxfFacade, S = DxfFacade> {
    pub(crate) loader: L,
    pub(crate) saver: S,
}

impl BatchRunner {
    pub fn new() -> Self {
        Self::with_io(DxfFacade::new(), DxfFacade::new())
    }
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: DocumentLoader, S: DocumentSaver> BatchRunner<L, S> {
    pub fn with_io(loader: L, saver: S) -> Self {
        Self { loader, saver }
    }

    /// 处理输入目录中的全部 `.dxf` 文件。只有输入目录无法列出时返回错误。
    pub fn run(&self, settings: &BatchSettings) -> Result<BatchReport, BatchError> {
        let drawings = list_drawings(&settings.input_dir)?;
        info!(
            input = %settings.input_dir.display(),
            output = %settings.output_dir.display(),
            files = drawings.len(),
            "开始批量规范化"
        );

        let shared = self.load_shared(settings);
        if let Err(err) = &shared {
            error!(error = %err, "共享输入不可用，全部图纸将标记为失败");
        }

        let mut report = BatchReport::default();
        for input in drawings {
            info!(file = %input.display(), "处理图纸");
            let status = match &shared {
                Ok((table, logo)) => match self.normalize_file(&input, settings, table, logo) {
                    Ok((output, file_report)) => {
                        info!(file = %input.display(), output = %output.display(), "图纸处理完成");
                        FileStatus::Normalized {
                            output,
                            report: file_report,
                        }
                    }
                    Err(err) => {
                        error!(file = %input.display(), error = %err, "图纸处理失败，已跳过");
                        FileStatus::Failed {
                            reason: err.to_string(),
                        }
                    }
                },
                Err(err) => FileStatus::Failed {
                    reason: err.to_string(),
                },
            };
            report.files.push(FileOutcome { input, status });
        }

        info!(
            succeeded = report.succeeded().count(),
            failed = report.failed().count(),
            "批量规范化结束"
        );
        Ok(report)
    }

    /// 映射表与标志文档每批只加载一次；未配置时分别视为空表与空文档。
    fn load_shared(&self, settings: &BatchSettings) -> Result<(Vec<RemapEntry>, Document), BatchError> {
        let table = match &settings.remap_table {
            Some(path) => {
                load_remap_table(path).map_err(|err| BatchError::TableUnavailable(err.to_string()))?
            }
            None => Vec::new(),
        };
        let logo = match &settings.logo_file {
            Some(path) => {
                let document = self
                    .loader
                    .load(path)
                    .map_err(|err| BatchError::LogoUnavailable(err.to_string()))?;
                prepare_logo(document, settings.options.explode_pass_limit)
                    .map_err(|err| BatchError::LogoUnavailable(err.to_string()))?
            }
            None => Document::new(),
        };
        info!(rows = table.len(), logo_entities = logo.entities().count(), "共享输入已就绪");
        Ok((table, logo))
    }

    fn normalize_file(
        &self,
        input: &Path,
        settings: &BatchSettings,
        table: &[RemapEntry],
        logo: &Document,
    ) -> Result<(PathBuf, NormalizeReport), BatchError> {
        let file_name = input
            .file_name()
            .ok_or_else(|| BatchError::MissingFileName(input.to_path_buf()))?;
        let mut document = self.loader.load(input)?;
        let report = normalize_document(&mut document, table, logo, &settings.options)?;
        let output = settings.output_dir.join(file_name);
        self.saver.save(&document, &output)?;
        Ok((output, report))
    }
}
