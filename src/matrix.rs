// 该文件是 Zhiyin （纸印） 项目的一部分。
// src/matrix.rs - 纸张逻辑网格矩阵
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

use image::GenericImageView;
use thiserror::Error;

use crate::config::{DEFAULT_MATRIX_MARKER, DEFAULT_SCALE_FACTOR};

/// A4 纸长边，单位厘米
pub const A4_HEIGHT_CM: f64 = 29.7;

#[derive(Error, Debug, PartialEq)]
pub enum MatrixError {
  #[error("缩放系数必须为正的有限数值, 实际 {0}")]
  InvalidScale(f64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMatrix {
  rows: usize,
  cols: usize,
  text: String,
}

impl TextMatrix {
  /// 从存储的字节恢复矩阵，列数按字符计
  pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
    let text = String::from_utf8(bytes).ok()?;
    let rows = text.lines().count();
    let cols = text.lines().next().map_or(0, |line| line.chars().count());
    Some(Self { rows, cols, text })
  }

  pub fn rows(&self) -> usize {
    self.rows
  }

  pub fn cols(&self) -> usize {
    self.cols
  }

  pub fn as_str(&self) -> &str {
    &self.text
  }

  pub fn as_bytes(&self) -> &[u8] {
    self.text.as_bytes()
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.text.into_bytes()
  }
}

#[derive(Debug, Clone, Copy)]
pub struct MatrixGenerator {
  scale: f64,
  marker: char,
}

impl Default for MatrixGenerator {
  fn default() -> Self {
    Self {
      scale: DEFAULT_SCALE_FACTOR,
      marker: DEFAULT_MATRIX_MARKER,
    }
  }
}

impl MatrixGenerator {
  pub fn new(scale: f64, marker: char) -> Result<Self, MatrixError> {
    if !scale.is_finite() || scale <= 0.0 {
      return Err(MatrixError::InvalidScale(scale));
    }
    Ok(Self { scale, marker })
  }

  pub fn scale(&self) -> f64 {
    self.scale
  }

  /// 行数为 ceil(height / K)，列数为 ceil(width / K)
  pub fn dimensions(&self, width: u32, height: u32) -> (usize, usize) {
    let rows = (height as f64 / self.scale).ceil() as usize;
    let cols = (width as f64 / self.scale).ceil() as usize;
    (rows, cols)
  }

  pub fn generate_for(&self, width: u32, height: u32) -> TextMatrix {
    let (rows, cols) = self.dimensions(width, height);
    let line: String = std::iter::repeat_n(self.marker, cols).collect();
    let text = vec![line; rows].join("\n");
    TextMatrix { rows, cols, text }
  }

  pub fn generate<I: GenericImageView>(&self, image: &I) -> TextMatrix {
    let (width, height) = image.dimensions();
    self.generate_for(width, height)
  }

  /// 假设纸张长边为 A4 高度时，每像素对应的厘米数
  pub fn centimetres_per_pixel(height: u32) -> Option<f64> {
    (height > 0).then(|| A4_HEIGHT_CM / height as f64)
  }
}
