use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use dxfnorm_core::document::Document;
use thiserror::Error;

mod reader;
mod writer;

pub mod listing;
pub mod table;

pub use listing::{list_drawings, sheet_suffix, sort_by_sheet_suffix};
pub use table::{TableFormat, load_remap_table};

#[derive(Debug, Error)]
pub enum IoError {
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("failed to read file {path:?}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write file {path:?}: {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to list directory {path:?}: {source}")]
    ListError {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("failed to serialize document: {0}")]
    SerializeError(#[source] std::io::Error),
    #[error("invalid document structure: {0}")]
    InvalidDocument(String),
    #[error("invalid remap table {path:?}: {message}")]
    InvalidTable { path: PathBuf, message: String },
}

pub trait DocumentLoader {
    fn load(&self, path: &Path) -> Result<Document, IoError>;
}

pub trait DocumentSaver {
    fn save(&self, document: &Document, path: &Path) -> Result<(), IoError>;
}

/// 文本 DXF 的读写入口。
#[derive(Debug, Default, Clone, Copy)]
pub struct DxfFacade;

impl DxfFacade {
    pub fn new() -> Self {
        Self
    }

    /// 从内存中的 DXF 文本解析文档。
    pub fn parse_str(&self, source: &str) -> Result<Document, IoError> {
        reader::DxfParser::new(source)
            .parse()
            .map_err(IoError::from)
    }

    /// 将文档序列化为 DXF 文本。
    pub fn write_string(&self, document: &Document) -> Result<String, IoError> {
        let mut buffer = Vec::new();
        writer::write_document(document, &mut buffer).map_err(IoError::SerializeError)?;
        String::from_utf8(buffer).map_err(|err| {
            IoError::SerializeError(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })
    }
}

impl DocumentLoader for DxfFacade {
    fn load(&self, path: &Path) -> Result<Document, IoError> {
        let bytes = fs::read(path).map_err(|source| IoError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse_str(&String::from_utf8_lossy(&bytes))
    }
}

impl DocumentSaver for DxfFacade {
    fn save(&self, document: &Document, path: &Path) -> Result<(), IoError> {
        let write_error = |source| IoError::WriteError {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        let file = File::create(path).map_err(write_error)?;
        writer::write_document(document, &mut BufWriter::new(file)).map_err(write_error)
    }
}
