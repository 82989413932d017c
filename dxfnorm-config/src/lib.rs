use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// 指定配置文件路径的环境变量。
pub const CONFIG_ENV: &str = "DXFNORM_CONFIG";

/// 应用配置的根结构。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl AppConfig {
    /// 从显式路径加载配置。文件中的相对路径以配置文件所在目录为基准。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        config.validate()?;
        Ok(config)
    }

    /// 自动发现配置文件：优先读取环境变量 `DXFNORM_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("default.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// 检查数值项，命令行覆盖之后也应再调用一次。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let length = self.pipeline.cloud_segment_length;
        if !length.is_finite() || length <= 0.0 {
            return Err(ConfigError::Invalid {
                message: format!("pipeline.cloud_segment_length 必须为正数，当前为 {length}"),
            });
        }
        if self.pipeline.explode_pass_limit == 0 {
            return Err(ConfigError::Invalid {
                message: "pipeline.explode_pass_limit 至少为 1".to_string(),
            });
        }
        Ok(())
    }

    fn rebase(&mut self, base: &Path) {
        let slots = [
            &mut self.pipeline.logo_file,
            &mut self.pipeline.remap_table,
            &mut self.paths.input_dir,
            &mut self.paths.output_dir,
            &mut self.paths.combined_output,
        ];
        for slot in slots {
            if let Some(path) = slot.as_mut() {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        }
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// 规范化流水线参数。
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// 合并到每份图纸中的标志文档。
    #[serde(default)]
    pub logo_file: Option<PathBuf>,
    #[serde(default)]
    pub remap_table: Option<PathBuf>,
    #[serde(default)]
    pub cloud_layers: Vec<String>,
    #[serde(default = "PipelineConfig::default_segment_length")]
    pub cloud_segment_length: f64,
    #[serde(default = "PipelineConfig::default_pass_limit")]
    pub explode_pass_limit: usize,
}

impl PipelineConfig {
    fn default_segment_length() -> f64 {
        6.0
    }

    fn default_pass_limit() -> usize {
        32
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            logo_file: None,
            remap_table: None,
            cloud_layers: Vec::new(),
            cloud_segment_length: Self::default_segment_length(),
            explode_pass_limit: Self::default_pass_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    #[serde(default)]
    pub input_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// 设置后额外输出一份多图纸合并文档。
    #[serde(default)]
    pub combined_output: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("配置无效: {message}")]
    Invalid { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.pipeline.logo_file.is_none());
        assert!(cfg.pipeline.cloud_layers.is_empty());
        assert!((cfg.pipeline.cloud_segment_length - 6.0).abs() < f64::EPSILON);
        assert_eq!(cfg.pipeline.explode_pass_limit, 32);
        assert!(cfg.paths.combined_output.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_from_temp_file() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("dxfnorm.toml");
        let mut file = fs::File::create(&path).expect("create config file");
        writeln!(
            file,
            r#"
            [logging]
            level = "debug"

            [pipeline]
            logo_file = "assets/logo.dxf"
            remap_table = "/abs/layers.toml"
            cloud_layers = ["REV", "CLOUD"]
            cloud_segment_length = 4.5

            [paths]
            input_dir = "in"
            output_dir = "out"
            "#
        )
        .unwrap();

        let cfg = AppConfig::from_file(&path).expect("load config");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(
            cfg.pipeline.logo_file.as_deref(),
            Some(dir.path().join("assets/logo.dxf").as_path())
        );
        assert_eq!(
            cfg.pipeline.remap_table.as_deref(),
            Some(Path::new("/abs/layers.toml"))
        );
        assert_eq!(cfg.pipeline.cloud_layers, vec!["REV", "CLOUD"]);
        assert!((cfg.pipeline.cloud_segment_length - 4.5).abs() < f64::EPSILON);
        assert_eq!(cfg.pipeline.explode_pass_limit, 32);
        assert_eq!(cfg.paths.input_dir, Some(dir.path().join("in")));
        assert!(cfg.paths.combined_output.is_none());
    }

    #[test]
    fn non_positive_segment_length_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "[pipeline]\ncloud_segment_length = 0.0").unwrap();
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "[pipeline\nlogo_file = 3").unwrap();
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let err = AppConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
