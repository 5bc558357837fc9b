// 该文件是 Zhiyin （纸印） 项目的一部分。
// src/pipeline.rs - 纸张隔离与身份识别流程
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  future::Future,
  io::Cursor,
  path::{Path, PathBuf},
  sync::atomic::{AtomicU32, Ordering},
  time::{Duration, Instant},
};

use chrono::Utc;
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  config::PipelineConfig,
  detection::{BoundaryDetector, DetectionError},
  geometry::{self, GeometryError, QUAD_CORNERS},
  matrix::{MatrixError, MatrixGenerator},
  qr::{QrDecoder, QrError},
  store::{ArtifactStore, Identifier, StoreError},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("边界检测不可用: {0}")]
  DetectionUnavailable(#[from] DetectionError),
  #[error("几何数据无效: {0}")]
  InvalidGeometry(#[from] GeometryError),
  #[error("二维码识别不可用: {0}")]
  ResolverUnavailable(#[from] QrError),
  #[error("存储不可用: {0}")]
  StorageUnavailable(#[from] StoreError),
  #[error("图像无法解码: {0}")]
  InvalidImage(image::ImageError),
  #[error("裁剪图像写入失败: {0}")]
  CropOutput(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 隔离流程的结果；未检测到与角点数量不对都是预期内的结果
#[derive(Debug)]
pub enum IsolateOutcome {
  NoBoundary,
  AmbiguousBoundary {
    corner_count: usize,
    label: String,
    confidence: f32,
  },
  Isolated {
    cropped: RgbImage,
    label: String,
    confidence: f32,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
  pub identifier: Identifier,
  pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolateResponse {
  pub success: bool,
  pub corner_count: usize,
  pub cropped_image_ref: Option<String>,
  pub label: Option<String>,
  pub confidence: Option<f32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

const NO_BOUNDARY: &str = "no boundary";
const AMBIGUOUS_BOUNDARY: &str = "ambiguous boundary";

impl IsolateResponse {
  fn failed(corner_count: usize, error: impl Into<String>) -> Self {
    Self {
      success: false,
      corner_count,
      cropped_image_ref: None,
      label: None,
      confidence: None,
      error: Some(error.into()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
  pub success: bool,
  pub identifier: Option<String>,
  pub is_new: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

pub struct Pipeline<D, Q> {
  detector: D,
  decoder: Q,
  store: ArtifactStore,
  generator: MatrixGenerator,
  config: PipelineConfig,
  crop_counter: AtomicU32,
}

fn decode_image(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
  let image = image::load_from_memory(bytes).map_err(PipelineError::InvalidImage)?;
  Ok(image.to_rgb8())
}

/// 二维码内容为空与未识别到同样处理
fn non_empty(payload: Option<String>) -> Option<String> {
  payload.filter(|p| !p.is_empty())
}

impl<D, Q> Pipeline<D, Q>
where
  D: BoundaryDetector + Sync,
  Q: QrDecoder + Sync,
{
  pub fn new(
    detector: D,
    decoder: Q,
    store: ArtifactStore,
    config: PipelineConfig,
  ) -> Result<Self, MatrixError> {
    let generator = MatrixGenerator::new(config.scale_factor, config.matrix_marker)?;
    Ok(Self {
      detector,
      decoder,
      store,
      generator,
      config,
      crop_counter: AtomicU32::new(0),
    })
  }

  pub fn store(&self) -> &ArtifactStore {
    &self.store
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  async fn with_deadline<T, E>(
    &self,
    call: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce(Duration) -> E,
  ) -> Result<T, E> {
    let deadline = self.config.request_timeout;
    match tokio::time::timeout(deadline, call).await {
      Ok(result) => result,
      Err(_) => {
        warn!("远程调用超时: {:?}", deadline);
        Err(on_timeout(deadline))
      }
    }
  }

  /// 检测 -> 角点数量检查 -> 裁剪
  pub async fn isolate_image(&self, image: &RgbImage) -> Result<IsolateOutcome, PipelineError> {
    let detection = self
      .with_deadline(self.detector.detect(image), DetectionError::Timeout)
      .await?;

    let Some(detection) = detection else {
      info!("未检测到纸张边界");
      return Ok(IsolateOutcome::NoBoundary);
    };

    info!(
      "检测到 {}: {:.2}%，角点 {} 个",
      detection.label,
      detection.confidence * 100.0,
      detection.corners.len()
    );

    if detection.corners.len() != QUAD_CORNERS {
      warn!("纸张边界不明确: {} 个角点", detection.corners.len());
      return Ok(IsolateOutcome::AmbiguousBoundary {
        corner_count: detection.corners.len(),
        label: detection.label,
        confidence: detection.confidence,
      });
    }

    let cropped = geometry::crop(image, &detection.corners)?;
    debug!("裁剪结果: {}x{}", cropped.width(), cropped.height());

    Ok(IsolateOutcome::Isolated {
      cropped,
      label: detection.label,
      confidence: detection.confidence,
    })
  }

  async fn decode_payload(&self, image: &RgbImage) -> Result<Option<String>, PipelineError> {
    let payload = self
      .with_deadline(self.decoder.decode(image), QrError::Timeout)
      .await?;
    Ok(non_empty(payload))
  }

  /// 识别二维码 -> 查库 -> 命中则返回已有标识符，否则生成矩阵并新建记录
  ///
  /// `hint` 通常是隔离流程得到的裁剪图，会先于原图尝试识别。
  pub async fn resolve_image(
    &self,
    image: &RgbImage,
    image_bytes: &[u8],
    filename: &str,
    hint: Option<&RgbImage>,
  ) -> Result<Resolution, PipelineError> {
    let mut payload = None;
    for candidate in hint.into_iter().chain(std::iter::once(image)) {
      payload = self.decode_payload(candidate).await?;
      if payload.is_some() {
        break;
      }
    }

    let given = match payload {
      Some(payload) => {
        let identifier = Identifier::new(payload)?;
        debug!("识别到二维码: {}", identifier);
        Some(identifier)
      }
      None => {
        info!("图像中未识别到二维码");
        None
      }
    };

    let matrix = self.generator.generate(image);
    debug!("生成网格矩阵: {}x{}", matrix.rows(), matrix.cols());

    let (identifier, is_new) = self
      .store
      .find_or_insert(given.as_ref(), filename, image_bytes, matrix.as_bytes())
      .await?;
    if is_new {
      info!("新纸张已记录: {}", identifier);
    } else {
      info!("已存在的纸张: {}", identifier);
    }

    Ok(Resolution { identifier, is_new })
  }

  fn crop_path(&self) -> PathBuf {
    let now = Utc::now();
    let seq = self.crop_counter.fetch_add(1, Ordering::Relaxed) + 1;
    self.config.crop_dir.join(format!(
      "cropped-{}-{:04X}.png",
      now.format("%Y%m%d-%H%M%S"),
      seq
    ))
  }

  async fn write_crop(&self, cropped: &RgbImage) -> Result<PathBuf, PipelineError> {
    let mut buffer = Vec::new();
    cropped
      .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
      .map_err(|e| PipelineError::CropOutput(e.to_string()))?;

    tokio::fs::create_dir_all(&self.config.crop_dir).await?;
    let path = self.crop_path();
    tokio::fs::write(&path, buffer).await?;
    info!("保存裁剪图像到文件: {}", path.display());
    Ok(path)
  }

  /// 供外部调用的隔离接口，任何失败都折叠为 `success: false`
  pub async fn isolate(&self, image_bytes: &[u8]) -> IsolateResponse {
    let now = Instant::now();
    let outcome = match decode_image(image_bytes) {
      Ok(image) => self.isolate_image(&image).await,
      Err(e) => Err(e),
    };

    let response = match outcome {
      Ok(IsolateOutcome::NoBoundary) => IsolateResponse::failed(0, NO_BOUNDARY),
      Ok(IsolateOutcome::AmbiguousBoundary {
        corner_count,
        label,
        confidence,
      }) => IsolateResponse {
        label: Some(label),
        confidence: Some(confidence),
        ..IsolateResponse::failed(corner_count, AMBIGUOUS_BOUNDARY)
      },
      Ok(IsolateOutcome::Isolated {
        cropped,
        label,
        confidence,
      }) => match self.write_crop(&cropped).await {
        Ok(path) => IsolateResponse {
          success: true,
          corner_count: QUAD_CORNERS,
          cropped_image_ref: Some(path.display().to_string()),
          label: Some(label),
          confidence: Some(confidence),
          error: None,
        },
        Err(e) => {
          error!("隔离流程失败: {}", e);
          IsolateResponse::failed(QUAD_CORNERS, e.to_string())
        }
      },
      Err(e) => {
        error!("隔离流程失败: {}", e);
        let corner_count = match e {
          PipelineError::InvalidGeometry(_) => QUAD_CORNERS,
          _ => 0,
        };
        IsolateResponse::failed(corner_count, e.to_string())
      }
    };

    info!("隔离流程完成，耗时: {:.2?}", now.elapsed());
    response
  }

  async fn resolve_inner(
    &self,
    image_bytes: &[u8],
    hint_image_path: Option<&Path>,
  ) -> Result<Resolution, PipelineError> {
    let image = decode_image(image_bytes)?;

    let hint = match hint_image_path {
      Some(path) => {
        let bytes = tokio::fs::read(path).await?;
        Some(decode_image(&bytes)?)
      }
      None => None,
    };

    let filename = hint_image_path
      .and_then(Path::file_name)
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| format!("capture-{}.png", Utc::now().format("%Y%m%d-%H%M%S")));

    self
      .resolve_image(&image, image_bytes, &filename, hint.as_ref())
      .await
  }

  /// 供外部调用的识别与记录接口
  pub async fn resolve(
    &self,
    image_bytes: &[u8],
    hint_image_path: Option<&Path>,
  ) -> ResolveResponse {
    let now = Instant::now();
    let response = match self.resolve_inner(image_bytes, hint_image_path).await {
      Ok(resolution) => ResolveResponse {
        success: true,
        identifier: Some(resolution.identifier.to_string()),
        is_new: resolution.is_new,
        error: None,
      },
      Err(e) => {
        error!("识别流程失败: {}", e);
        ResolveResponse {
          success: false,
          identifier: None,
          is_new: false,
          error: Some(e.to_string()),
        }
      }
    };

    info!("识别流程完成，耗时: {:.2?}", now.elapsed());
    response
  }
}
