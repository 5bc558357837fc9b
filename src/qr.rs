// 该文件是 Zhiyin （纸印） 项目的一部分。
// src/qr.rs - 二维码识别
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
use thiserror::Error;
use url::Url;

use crate::{FromUrl, config::EndpointError};
#[cfg(any(feature = "local_qr", feature = "remote_qr"))]
use crate::FromUrlWithScheme;

#[cfg(feature = "local_qr")]
mod local;
#[cfg(feature = "local_qr")]
pub use self::local::LocalQrDecoder;

#[cfg(feature = "remote_qr")]
mod remote;
#[cfg(feature = "remote_qr")]
pub use self::remote::RemoteQrDecoder;

#[derive(Error, Debug)]
pub enum QrError {
  #[cfg(feature = "remote_qr")]
  #[error("网络请求错误: {0}")]
  Transport(#[from] reqwest::Error),
  #[error("识别服务返回错误状态 {status}: {body}")]
  Status { status: u16, body: String },
  #[error("识别结果格式错误: {0}")]
  Malformed(#[from] serde_json::Error),
  #[error("图像编码错误: {0}")]
  Encode(#[from] image::ImageError),
  #[error("识别任务异常退出: {0}")]
  Worker(#[from] tokio::task::JoinError),
  #[error("识别请求超时 ({0:?})")]
  Timeout(Duration),
  #[error("识别服务地址无效: {0}")]
  InvalidEndpoint(#[from] EndpointError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 二维码识别能力
///
/// 图像中没有二维码是正常结果，返回 `Ok(None)`；只有传输或服务故障才返回错误。
pub trait QrDecoder {
  fn decode(
    &self,
    image: &RgbImage,
  ) -> impl Future<Output = Result<Option<String>, QrError>> + Send;
}

pub enum QrDecoderWrapper {
  #[cfg(feature = "local_qr")]
  Local(LocalQrDecoder),
  #[cfg(feature = "remote_qr")]
  Remote(RemoteQrDecoder),
}

impl FromUrl for QrDecoderWrapper {
  type Error = QrError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "local_qr")]
      LocalQrDecoder::SCHEME => Ok(QrDecoderWrapper::Local(LocalQrDecoder::from_url(url)?)),
      #[cfg(feature = "remote_qr")]
      RemoteQrDecoder::SCHEME | remote::REMOTE_QR_PLAIN_HTTP_SCHEME => {
        Ok(QrDecoderWrapper::Remote(RemoteQrDecoder::from_url(url)?))
      }
      _ => Err(QrError::SchemeMismatch),
    }
  }
}

impl QrDecoderWrapper {
  /// 本地识别不发起网络请求，超时仅作用于远程服务
  #[cfg_attr(not(feature = "remote_qr"), allow(unused_variables))]
  pub fn with_timeout(self, timeout: Duration) -> Result<Self, QrError> {
    match self {
      #[cfg(feature = "local_qr")]
      QrDecoderWrapper::Local(decoder) => Ok(QrDecoderWrapper::Local(decoder)),
      #[cfg(feature = "remote_qr")]
      QrDecoderWrapper::Remote(decoder) => {
        Ok(QrDecoderWrapper::Remote(decoder.with_timeout(timeout)?))
      }
    }
  }
}

impl QrDecoder for QrDecoderWrapper {
  async fn decode(&self, image: &RgbImage) -> Result<Option<String>, QrError> {
    match self {
      #[cfg(feature = "local_qr")]
      QrDecoderWrapper::Local(decoder) => decoder.decode(image).await,
      #[cfg(feature = "remote_qr")]
      QrDecoderWrapper::Remote(decoder) => decoder.decode(image).await,
    }
  }
}
