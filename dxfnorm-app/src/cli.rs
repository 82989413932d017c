use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use dxfnorm_batch::{BatchReport, BatchRunner, BatchSettings, CombineReport, FileStatus, SheetStatus};
use dxfnorm_config::AppConfig;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "dxfnorm", version, about = "批量规范化 DXF 图纸的图层、块与标志")]
pub struct Args {
    /// 配置文件；缺省时依次查找 DXFNORM_CONFIG 与 ./config/default.toml
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 规范化输入目录中的全部图纸
    Normalize(NormalizeArgs),
    /// 把目录中的图纸按图号合并为多图纸文档
    Combine(CombineArgs),
}

#[derive(clap::Args, Debug)]
pub struct NormalizeArgs {
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,

    /// 输出目录，缺省为输入目录下的 adjusted/
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// 图层映射表（.toml 或 .json）
    #[arg(long = "table")]
    pub table: Option<PathBuf>,

    /// 标志文档
    #[arg(long = "logo")]
    pub logo: Option<PathBuf>,

    /// 重建修订云线的图层，可重复
    #[arg(long = "cloud-layer")]
    pub cloud_layers: Vec<String>,

    /// 额外输出的合并文档
    #[arg(long = "combined")]
    pub combined: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct CombineArgs {
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,

    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
}

pub fn run() -> Result<()> {
    let args = Args::parse();
    let config = load_configuration(args.config.as_deref())?;
    init_logging(&config);
    info!("启动 dxfnorm");

    match args.command {
        Command::Normalize(normalize) => run_normalize(config, normalize),
        Command::Combine(combine) => run_combine(&config, combine),
    }
}

fn load_configuration(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("加载配置 {} 失败", path.display())),
        None => AppConfig::discover().context("加载默认配置失败"),
    }
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if subscriber.try_init().is_err() {
        // 已初始化，忽略
    }
}

fn run_normalize(mut config: AppConfig, args: NormalizeArgs) -> Result<()> {
    if let Some(input) = args.input {
        config.paths.input_dir = Some(input);
    }
    if let Some(output) = args.output {
        config.paths.output_dir = Some(output);
    }
    if let Some(table) = args.table {
        config.pipeline.remap_table = Some(table);
    }
    if let Some(logo) = args.logo {
        config.pipeline.logo_file = Some(logo);
    }
    if !args.cloud_layers.is_empty() {
        config.pipeline.cloud_layers = args.cloud_layers;
    }
    if let Some(combined) = args.combined {
        config.paths.combined_output = Some(combined);
    }
    config.validate()?;

    let settings = BatchSettings::from_config(&config);
    let runner = BatchRunner::new();
    let report = runner
        .run(&settings)
        .with_context(|| format!("无法处理输入目录 {}", settings.input_dir.display()))?;
    print_batch_summary(&report);

    if let Some(combined) = &config.paths.combined_output {
        let combine = runner
            .combine(report.outputs(), combined)
            .with_context(|| format!("写出合并文档 {} 失败", combined.display()))?;
        print_combine_summary(&combine);
    }
    Ok(())
}

fn run_combine(config: &AppConfig, args: CombineArgs) -> Result<()> {
    let input = args
        .input
        .or_else(|| config.paths.output_dir.clone())
        .ok_or_else(|| anyhow!("combine 需要 --input 或配置项 paths.output_dir"))?;
    let output = args
        .output
        .or_else(|| config.paths.combined_output.clone())
        .ok_or_else(|| anyhow!("combine 需要 --output 或配置项 paths.combined_output"))?;

    let report = BatchRunner::new()
        .combine_dir(&input, &output)
        .with_context(|| format!("合并目录 {} 失败", input.display()))?;
    print_combine_summary(&report);
    Ok(())
}

fn print_batch_summary(report: &BatchReport) {
    for outcome in &report.files {
        match &outcome.status {
            FileStatus::Normalized {
                output,
                report: steps,
            } => println!(
                "OK    {} -> {} (炸开 {}, 清理块 {}, 移动实体 {}, 云线 {})",
                outcome.file_name(),
                output.display(),
                steps.explode.exploded,
                steps.purge.deleted().count(),
                steps.remap.entities_moved,
                steps.clouds.len(),
            ),
            FileStatus::Failed { reason } => {
                println!("FAIL  {}: {}", outcome.file_name(), reason)
            }
        }
    }
    println!(
        "处理完成: 成功 {}, 失败 {}",
        report.succeeded().count(),
        report.failed().count()
    );
}

fn print_combine_summary(report: &CombineReport) {
    for sheet in &report.sheets {
        let file = sheet.input.display();
        match &sheet.status {
            SheetStatus::Merged { merge, .. } => println!(
                "{:<5} <- {} (实体 {}, 跳过 {})",
                sheet.sheet,
                file,
                merge.entities.applied_count(),
                merge.entities.skipped_count(),
            ),
            SheetStatus::Failed { reason } => println!("{:<5} <- {}: 失败 {}", sheet.sheet, file, reason),
        }
    }
    println!(
        "合并文档已写出: {} ({} 张图纸)",
        report.output.display(),
        report.sheets.len()
    );
}
