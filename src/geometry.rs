// 该文件是 Zhiyin （纸印） 项目的一部分。
// src/geometry.rs - 四边形、包围盒与裁剪
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

use image::{RgbImage, imageops};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const QUAD_CORNERS: usize = 4;

#[derive(Error, Debug, PartialEq)]
pub enum GeometryError {
  #[error("角点数量错误: 期望 4 个, 实际 {0} 个")]
  CornerCount(usize),
  #[error("角点坐标不是有限数值")]
  NonFinite,
  #[error("包围盒退化: 宽 {width}, 高 {height}")]
  Degenerate { width: f64, height: f64 },
  #[error("裁剪区域 {rect:?} 超出图像范围 {image_width}x{image_height}")]
  OutOfBounds {
    rect: PixelRect,
    image_width: u32,
    image_height: u32,
  },
}

/// 源图像像素坐标系中的点
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
  pub x: f64,
  pub y: f64,
}

impl Point {
  pub fn new(x: f64, y: f64) -> Self {
    Self { x, y }
  }
}

impl From<(f64, f64)> for Point {
  fn from((x, y): (f64, f64)) -> Self {
    Self { x, y }
  }
}

/// 四个角点的最小/最大包围盒，与角点顺序无关
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
  pub min_x: f64,
  pub min_y: f64,
  pub max_x: f64,
  pub max_y: f64,
}

/// 取整后的裁剪矩形，左上角包含在内
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelRect {
  pub left: i64,
  pub top: i64,
  pub width: u32,
  pub height: u32,
}

impl BoundingBox {
  pub fn from_corners(corners: &[Point]) -> Result<Self, GeometryError> {
    if corners.len() != QUAD_CORNERS {
      return Err(GeometryError::CornerCount(corners.len()));
    }
    if corners.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
      return Err(GeometryError::NonFinite);
    }

    let init = BoundingBox {
      min_x: f64::INFINITY,
      min_y: f64::INFINITY,
      max_x: f64::NEG_INFINITY,
      max_y: f64::NEG_INFINITY,
    };
    Ok(corners.iter().fold(init, |bbox, p| BoundingBox {
      min_x: bbox.min_x.min(p.x),
      min_y: bbox.min_y.min(p.y),
      max_x: bbox.max_x.max(p.x),
      max_y: bbox.max_y.max(p.y),
    }))
  }

  pub fn width(&self) -> f64 {
    self.max_x - self.min_x
  }

  pub fn height(&self) -> f64 {
    self.max_y - self.min_y
  }

  /// 取整只在 min/max 之后进行一次
  pub fn to_pixel_rect(&self) -> Result<PixelRect, GeometryError> {
    let width = self.width().round();
    let height = self.height().round();
    if width <= 0.0 || height <= 0.0 || width > u32::MAX as f64 || height > u32::MAX as f64 {
      return Err(GeometryError::Degenerate {
        width: self.width(),
        height: self.height(),
      });
    }

    Ok(PixelRect {
      left: self.min_x.round() as i64,
      top: self.min_y.round() as i64,
      width: width as u32,
      height: height as u32,
    })
  }
}

impl PixelRect {
  fn fits_in(&self, image_width: u32, image_height: u32) -> bool {
    self.left >= 0
      && self.top >= 0
      && self.left + self.width as i64 <= image_width as i64
      && self.top + self.height as i64 <= image_height as i64
  }
}

/// 按四个角点的轴对齐包围盒裁剪图像
pub fn crop(image: &RgbImage, corners: &[Point]) -> Result<RgbImage, GeometryError> {
  let rect = BoundingBox::from_corners(corners)?.to_pixel_rect()?;
  if !rect.fits_in(image.width(), image.height()) {
    return Err(GeometryError::OutOfBounds {
      rect,
      image_width: image.width(),
      image_height: image.height(),
    });
  }

  debug!(
    "裁剪区域: ({}, {}) {}x{}",
    rect.left, rect.top, rect.width, rect.height
  );
  Ok(
    imageops::crop_imm(
      image,
      rect.left as u32,
      rect.top as u32,
      rect.width,
      rect.height,
    )
    .to_image(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  fn quad(points: [(f64, f64); 4]) -> Vec<Point> {
    points.into_iter().map(Point::from).collect()
  }

  #[test]
  fn crop_axis_aligned_quad() {
    let mut image = RgbImage::new(200, 200);
    image.put_pixel(0, 0, Rgb([255, 0, 0]));
    image.put_pixel(99, 49, Rgb([0, 255, 0]));

    let corners = quad([(0.0, 0.0), (100.0, 0.0), (100.0, 50.0), (0.0, 50.0)]);
    let cropped = crop(&image, &corners).unwrap();

    assert_eq!(cropped.dimensions(), (100, 50));
    assert_eq!(cropped.get_pixel(0, 0), &Rgb([255, 0, 0]));
    assert_eq!(cropped.get_pixel(99, 49), &Rgb([0, 255, 0]));
  }

  #[test]
  fn crop_is_independent_of_corner_order() {
    let image = RgbImage::new(300, 300);
    let base = [(12.4, 30.6), (180.2, 28.9), (181.7, 140.3), (10.1, 142.8)];
    let expected = crop(&image, &quad(base)).unwrap().dimensions();

    let orders = [[3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1], [0, 2, 1, 3]];
    for order in orders {
      let permuted = order.map(|i| base[i]);
      assert_eq!(crop(&image, &quad(permuted)).unwrap().dimensions(), expected);
    }
  }

  #[test]
  fn rounding_is_applied_after_min_max() {
    let bbox =
      BoundingBox::from_corners(&quad([(0.4, 0.4), (10.8, 0.4), (10.8, 5.9), (0.4, 5.9)]))
        .unwrap();
    let rect = bbox.to_pixel_rect().unwrap();
    // 10.4 与 5.5 各自取整，而不是对每个角点分别取整后相减
    assert_eq!(rect.width, 10);
    assert_eq!(rect.height, 6);
    assert_eq!((rect.left, rect.top), (0, 0));
  }

  #[test]
  fn degenerate_box_is_rejected() {
    let image = RgbImage::new(50, 50);
    let line = quad([(5.0, 5.0), (40.0, 5.0), (40.0, 5.2), (5.0, 5.2)]);
    assert!(matches!(
      crop(&image, &line),
      Err(GeometryError::Degenerate { .. })
    ));

    let point = quad([(7.0, 7.0); 4]);
    assert!(matches!(
      crop(&image, &point),
      Err(GeometryError::Degenerate { .. })
    ));
  }

  #[test]
  fn wrong_corner_count_is_rejected() {
    let image = RgbImage::new(50, 50);
    let three = vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(1.0, 1.0)];
    assert_eq!(crop(&image, &three), Err(GeometryError::CornerCount(3)));
  }

  #[test]
  fn box_outside_image_is_rejected() {
    let image = RgbImage::new(100, 100);
    let overflow = quad([(50.0, 50.0), (150.0, 50.0), (150.0, 90.0), (50.0, 90.0)]);
    assert!(matches!(
      crop(&image, &overflow),
      Err(GeometryError::OutOfBounds {
        image_width: 100,
        ..
      })
    ));

    let negative = quad([(-10.0, 0.0), (20.0, 0.0), (20.0, 20.0), (-10.0, 20.0)]);
    assert!(matches!(
      crop(&image, &negative),
      Err(GeometryError::OutOfBounds { .. })
    ));
  }

  #[test]
  fn non_finite_corners_are_rejected() {
    let corners = quad([(f64::NAN, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
    assert_eq!(
      BoundingBox::from_corners(&corners),
      Err(GeometryError::NonFinite)
    );
  }
}
