// 该文件是 Zhiyin （纸印） 项目的一部分。
// src/main.rs - 命令行入口
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};
use url::Url;

use zhiyin::{
  FromUrl,
  config::{DEFAULT_SCALE_FACTOR, PipelineConfig},
  detection::RoboflowDetector,
  matrix::{MatrixGenerator, TextMatrix},
  pipeline::Pipeline,
  qr::QrDecoderWrapper,
  store::{ArtifactStore, ArtifactStoreBuilder, Identifier},
};

/// Zhiyin 纸张识别参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 边界检测服务地址
  /// - roboflow://detect.roboflow.com/<model>/<version>?api_key=<key>
  /// - roboflow+http://localhost:9001/<model>/<version>
  #[arg(
    long,
    value_name = "DETECTOR",
    env = "ZHIYIN_DETECTOR",
    default_value = "roboflow+http://localhost:9001/qr-code-detection-9y8lj/1"
  )]
  pub detector: Url,

  /// 二维码识别方式: local: 或 qr+https://<host>/<path>
  #[arg(long, value_name = "DECODER", env = "ZHIYIN_QR", default_value = "local:")]
  pub qr: Url,

  /// 制品数据库
  #[arg(
    long,
    value_name = "STORE",
    env = "ZHIYIN_STORE",
    default_value = "sqlite://zhiyin.sqlite"
  )]
  pub store: Url,

  /// 远程调用超时（毫秒）
  #[arg(long, default_value = "10000", value_name = "MILLIS")]
  pub timeout_ms: u64,

  /// 每个网格单元对应的像素数
  #[arg(long, default_value_t = DEFAULT_SCALE_FACTOR, value_name = "PIXELS")]
  pub scale: f64,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 检测并裁剪照片中的纸张
  Isolate {
    /// 输入照片
    #[arg(long, value_name = "IMAGE")]
    input: PathBuf,
    /// 裁剪图像输出目录，默认与输入同目录
    #[arg(long, value_name = "DIR")]
    crop_dir: Option<PathBuf>,
  },
  /// 识别纸张二维码，已知纸张返回原标识符，否则新建记录
  Resolve {
    /// 输入照片
    #[arg(long, value_name = "IMAGE")]
    input: PathBuf,
    /// 优先识别的图像（通常为裁剪结果）
    #[arg(long, value_name = "IMAGE")]
    hint: Option<PathBuf>,
  },
  /// 查询已记录的纸张
  Lookup {
    /// 纸张标识符，缺省时返回最近一条记录
    #[arg(long, value_name = "ID")]
    identifier: Option<String>,
    /// 将网格矩阵写入该文件
    #[arg(long, value_name = "FILE")]
    matrix_out: Option<PathBuf>,
  },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupReport {
  identifier: String,
  filename: String,
  created_at: String,
  image_bytes: usize,
  image_width: Option<u32>,
  image_height: Option<u32>,
  centimetres_per_pixel: Option<f64>,
  matrix_rows: usize,
  matrix_cols: usize,
}

async fn lookup(
  store: &ArtifactStore,
  identifier: Option<String>,
  matrix_out: Option<PathBuf>,
) -> Result<()> {
  let artifact = match identifier {
    Some(identifier) => store.lookup(&Identifier::new(identifier)?).await?,
    None => store.latest().await?,
  }
  .ok_or_else(|| anyhow!("没有找到对应的纸张记录"))?;

  let dimensions = image::load_from_memory(&artifact.image)
    .ok()
    .map(|image| (image.width(), image.height()));
  let (matrix_rows, matrix_cols) = TextMatrix::from_bytes(artifact.matrix.clone())
    .map_or((0, 0), |matrix| (matrix.rows(), matrix.cols()));

  if let Some(path) = matrix_out {
    tokio::fs::write(&path, &artifact.matrix)
      .await
      .with_context(|| format!("无法写入矩阵文件: {}", path.display()))?;
    info!("网格矩阵已写入: {}", path.display());
  }

  let report = LookupReport {
    identifier: artifact.identifier.to_string(),
    filename: artifact.filename,
    created_at: artifact.created_at.to_rfc3339(),
    image_bytes: artifact.image.len(),
    image_width: dimensions.map(|(w, _)| w),
    image_height: dimensions.map(|(_, h)| h),
    centimetres_per_pixel: dimensions.and_then(|(_, h)| MatrixGenerator::centimetres_per_pixel(h)),
    matrix_rows,
    matrix_cols,
  };
  println!("{}", serde_json::to_string_pretty(&report)?);
  Ok(())
}

fn build_pipeline(
  detector: &Url,
  qr: &Url,
  store: ArtifactStore,
  config: PipelineConfig,
) -> Result<Pipeline<RoboflowDetector, QrDecoderWrapper>> {
  let timeout = config.request_timeout;
  let detector = RoboflowDetector::from_url(detector)?.with_timeout(timeout)?;
  let decoder = QrDecoderWrapper::from_url(qr)?.with_timeout(timeout)?;
  Ok(Pipeline::new(detector, decoder, store, config)?)
}

async fn read_input(input: &Path) -> Result<Vec<u8>> {
  tokio::fs::read(input)
    .await
    .with_context(|| format!("无法读取输入图像: {}", input.display()))
}

async fn isolate(
  pipeline: &Pipeline<RoboflowDetector, QrDecoderWrapper>,
  input: &Path,
) -> Result<()> {
  let response = pipeline.isolate(&read_input(input).await?).await;
  println!("{}", serde_json::to_string_pretty(&response)?);
  Ok(())
}

async fn resolve(
  pipeline: &Pipeline<RoboflowDetector, QrDecoderWrapper>,
  input: &Path,
  hint: Option<&Path>,
) -> Result<()> {
  let response = pipeline.resolve(&read_input(input).await?, hint).await;
  println!("{}", serde_json::to_string_pretty(&response)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  fmt().with_env_filter(EnvFilter::from_default_env()).init();

  let Args {
    detector,
    qr,
    store,
    timeout_ms,
    scale,
    command,
  } = Args::parse();

  info!("检测服务: {}", detector);
  info!("二维码识别: {}", qr);
  info!("制品数据库: {}", store);

  let store = ArtifactStoreBuilder::from_url(&store)?.build().await?;
  let config = PipelineConfig::default()
    .with_request_timeout(Duration::from_millis(timeout_ms))
    .with_scale_factor(scale);

  let result = match command {
    Command::Isolate { input, crop_dir } => {
      let crop_dir = crop_dir
        .or_else(|| {
          input
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from("."));
      let config = config.with_crop_dir(crop_dir);
      match build_pipeline(&detector, &qr, store.clone(), config) {
        Ok(pipeline) => isolate(&pipeline, &input).await,
        Err(e) => Err(e),
      }
    }
    Command::Resolve { input, hint } => {
      match build_pipeline(&detector, &qr, store.clone(), config) {
        Ok(pipeline) => resolve(&pipeline, &input, hint.as_deref()).await,
        Err(e) => Err(e),
      }
    }
    Command::Lookup {
      identifier,
      matrix_out,
    } => lookup(&store, identifier, matrix_out).await,
  };

  store.close().await;
  result
}
