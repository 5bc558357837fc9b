// 该文件是 Zhiyin （纸印） 项目的一部分。
// src/config.rs - 流水线配置
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

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// 每个逻辑格子对应的像素数
pub const DEFAULT_SCALE_FACTOR: f64 = 7.5;
pub const DEFAULT_MATRIX_MARKER: char = '1';

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub request_timeout: Duration,
  pub scale_factor: f64,
  pub matrix_marker: char,
  pub crop_dir: PathBuf,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      request_timeout: DEFAULT_REQUEST_TIMEOUT,
      scale_factor: DEFAULT_SCALE_FACTOR,
      matrix_marker: DEFAULT_MATRIX_MARKER,
      crop_dir: std::env::temp_dir(),
    }
  }
}

impl PipelineConfig {
  pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout = timeout;
    self
  }

  pub fn with_scale_factor(mut self, scale_factor: f64) -> Self {
    self.scale_factor = scale_factor;
    self
  }

  pub fn with_matrix_marker(mut self, marker: char) -> Self {
    self.matrix_marker = marker;
    self
  }

  pub fn with_crop_dir(mut self, crop_dir: impl Into<PathBuf>) -> Self {
    self.crop_dir = crop_dir.into();
    self
  }
}

#[derive(Error, Debug, PartialEq)]
pub enum EndpointError {
  #[error("缺少主机名: {0}")]
  MissingHost(String),
  #[error("端口无效: {0}")]
  InvalidPort(String),
  #[error("地址解析失败: {0}")]
  Parse(#[from] url::ParseError),
}

/// 将 `roboflow://host/path` 这类方案地址换成实际请求的 http(s) 地址
pub(crate) fn rebase_endpoint(url: &url::Url, protocol: &str) -> Result<url::Url, EndpointError> {
  let host = url
    .host_str()
    .ok_or_else(|| EndpointError::MissingHost(url.to_string()))?;
  let mut endpoint = url::Url::parse(&format!("{}://{}", protocol, host))?;
  endpoint
    .set_port(url.port())
    .map_err(|_| EndpointError::InvalidPort(url.to_string()))?;
  endpoint.set_path(url.path());
  endpoint.set_query(url.query());
  Ok(endpoint)
}
