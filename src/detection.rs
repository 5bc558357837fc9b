// 该文件是 Zhiyin （纸印） 项目的一部分。
// src/detection.rs - 纸张边界检测
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

use std::{future::Future, time::Duration};

use image::RgbImage;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{config::EndpointError, geometry::Point};

#[cfg(feature = "roboflow_detector")]
mod roboflow;
#[cfg(feature = "roboflow_detector")]
pub use self::roboflow::RoboflowDetector;

#[derive(Error, Debug)]
pub enum DetectionError {
  #[cfg(feature = "roboflow_detector")]
  #[error("网络请求错误: {0}")]
  Transport(#[from] reqwest::Error),
  #[error("检测服务返回错误状态 {status}: {body}")]
  Status { status: u16, body: String },
  #[error("检测结果格式错误: {0}")]
  Malformed(#[from] serde_json::Error),
  #[error("图像编码错误: {0}")]
  Encode(#[from] image::ImageError),
  #[error("检测请求超时 ({0:?})")]
  Timeout(Duration),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("检测服务地址无效: {0}")]
  InvalidEndpoint(#[from] EndpointError),
}

/// 一次检测调用选出的唯一结果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub label: String,
  pub confidence: f32,
  pub corners: Vec<Point>,
}

/// 边界检测能力，远程服务或本地模型均可实现
pub trait BoundaryDetector {
  /// 返回置信度最高的检测结果；没有任何预测时返回 `None`
  fn detect(
    &self,
    image: &RgbImage,
  ) -> impl Future<Output = Result<Option<Detection>, DetectionError>> + Send;
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct PredictionPoint {
  x: f64,
  y: f64,
}

/// 检测服务返回的单个预测，中心点 + 宽高
#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
  pub x: f64,
  pub y: f64,
  pub width: f64,
  pub height: f64,
  pub confidence: f32,
  #[serde(rename = "class", default)]
  pub label: String,
  // 分割模型会直接给出多边形顶点
  #[serde(default)]
  points: Option<Vec<PredictionPoint>>,
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
  #[serde(default)]
  predictions: Vec<Prediction>,
}

impl Prediction {
  /// 多边形顶点原样返回，否则由中心点与宽高换算为
  /// 左上、右上、右下、左下四个角点
  pub fn corners(&self) -> Vec<Point> {
    if let Some(points) = self.points.as_ref().filter(|p| !p.is_empty()) {
      return points.iter().map(|p| Point::new(p.x, p.y)).collect();
    }

    let half_w = self.width / 2.0;
    let half_h = self.height / 2.0;
    vec![
      Point::new(self.x - half_w, self.y - half_h),
      Point::new(self.x + half_w, self.y - half_h),
      Point::new(self.x + half_w, self.y + half_h),
      Point::new(self.x - half_w, self.y + half_h),
    ]
  }

  pub fn into_detection(self) -> Detection {
    Detection {
      corners: self.corners(),
      label: self.label,
      confidence: self.confidence,
    }
  }
}

/// 选出置信度严格最大的预测，相同置信度保留先出现的
pub fn select_best(predictions: Vec<Prediction>) -> Option<Prediction> {
  predictions.into_iter().fold(None, |best, candidate| match best {
    Some(current) if candidate.confidence <= current.confidence => Some(current),
    _ => Some(candidate),
  })
}

/// 解析检测服务的 JSON 响应，忽略未知字段
pub fn parse_predictions(body: &str) -> Result<Option<Detection>, DetectionError> {
  let response: PredictionResponse = serde_json::from_str(body)?;
  debug!("检测服务返回 {} 个预测", response.predictions.len());
  Ok(select_best(response.predictions).map(Prediction::into_detection))
}
