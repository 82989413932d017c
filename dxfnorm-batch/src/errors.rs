use std::path::PathBuf;

use dxfnorm_engine::errors::EngineError;
use dxfnorm_io::IoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("标志文档不可用: {0}")]
    LogoUnavailable(String),
    #[error("图层映射表不可用: {0}")]
    TableUnavailable(String),
    #[error("无法确定 {0:?} 的输出文件名")]
    MissingFileName(PathBuf),
}
