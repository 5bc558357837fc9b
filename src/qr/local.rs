// 该文件是 Zhiyin （纸印） 项目的一部分。
// src/qr/local.rs - 本地二维码识别
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

use image::{GrayImage, RgbImage, imageops};
use rqrr::PreparedImage;
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  qr::{QrDecoder, QrError},
};

const BINARY_THRESHOLD: u8 = 128;

/// 进程内 rqrr 识别，依次尝试灰度图与固定阈值二值图
#[derive(Debug, Clone, Default)]
pub struct LocalQrDecoder;

impl FromUrlWithScheme for LocalQrDecoder {
  const SCHEME: &'static str = "local";
}

impl FromUrl for LocalQrDecoder {
  type Error = QrError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(QrError::SchemeMismatch);
    }
    Ok(LocalQrDecoder)
  }
}

fn first_payload<M, E: std::fmt::Debug>(
  results: impl IntoIterator<Item = Result<(M, String), E>>,
) -> Option<String> {
  for result in results {
    match result {
      Ok((_, content)) => return Some(content),
      Err(e) => debug!("二维码网格解码失败: {:?}", e),
    }
  }
  None
}

fn decode_gray(gray: &GrayImage) -> Option<String> {
  let (w, h) = (gray.width() as usize, gray.height() as usize);
  if w == 0 || h == 0 {
    return None;
  }

  let pixel = |x: usize, y: usize| gray.get_pixel(x as u32, y as u32).0[0];

  let mut prepared = PreparedImage::prepare_from_greyscale(w, h, pixel);
  let grids = prepared.detect_grids();
  if let Some(payload) = first_payload(grids.iter().map(|g| g.decode())) {
    return Some(payload);
  }

  debug!("灰度图未识别到二维码，尝试二值化");
  let mut prepared =
    PreparedImage::prepare_from_bitmap(w, h, |x, y| pixel(x, y) < BINARY_THRESHOLD);
  let grids = prepared.detect_grids();
  first_payload(grids.iter().map(|g| g.decode()))
}

impl QrDecoder for LocalQrDecoder {
  async fn decode(&self, image: &RgbImage) -> Result<Option<String>, QrError> {
    let gray = imageops::grayscale(image);
    let payload = tokio::task::spawn_blocking(move || decode_gray(&gray)).await?;
    debug!("本地二维码识别结果: {:?}", payload);
    Ok(payload)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn blank_image_has_no_payload() {
    let image = RgbImage::from_pixel(64, 64, image::Rgb([255, 255, 255]));
    assert_eq!(LocalQrDecoder.decode(&image).await.unwrap(), None);
  }

  #[tokio::test]
  async fn empty_image_has_no_payload() {
    let image = RgbImage::new(0, 0);
    assert_eq!(LocalQrDecoder.decode(&image).await.unwrap(), None);
  }

  #[test]
  fn scheme_must_be_local() {
    let url = Url::parse("remote:").unwrap();
    assert!(matches!(
      LocalQrDecoder::from_url(&url),
      Err(QrError::SchemeMismatch)
    ));
  }
}
