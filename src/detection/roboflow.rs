// 该文件是 Zhiyin （纸印） 项目的一部分。
// src/detection/roboflow.rs - 远程检测服务客户端
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

use std::{io::Cursor, time::Duration};

use base64::{Engine as _, engine::general_purpose};
use image::{ImageFormat, RgbImage};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::{DEFAULT_REQUEST_TIMEOUT, rebase_endpoint},
  detection::{BoundaryDetector, Detection, DetectionError, parse_predictions},
};

const ROBOFLOW_PLAIN_HTTP_SCHEME: &str = "roboflow+http";

/// 以 data URL 形式上传图像的检测服务客户端
///
/// `roboflow://detect.roboflow.com/<model>/<version>?api_key=<key>` 映射为 HTTPS 请求，
/// `roboflow+http://` 用于本地推理服务。
#[derive(Debug, Clone)]
pub struct RoboflowDetector {
  client: reqwest::Client,
  endpoint: Url,
  timeout: Duration,
}

impl FromUrlWithScheme for RoboflowDetector {
  const SCHEME: &'static str = "roboflow";
}

impl FromUrl for RoboflowDetector {
  type Error = DetectionError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let protocol = match url.scheme() {
      Self::SCHEME => "https",
      ROBOFLOW_PLAIN_HTTP_SCHEME => "http",
      other => {
        error!(
          "URI scheme mismatch: expected '{}', found '{}'",
          Self::SCHEME,
          other
        );
        return Err(DetectionError::SchemeMismatch(format!(
          "期望检测方式 '{}', 实际检测方式 '{}'",
          Self::SCHEME,
          other
        )));
      }
    };

    let endpoint = rebase_endpoint(url, protocol)?;
    Self::new(endpoint, DEFAULT_REQUEST_TIMEOUT)
  }
}

impl RoboflowDetector {
  pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, DetectionError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self {
      client,
      endpoint,
      timeout,
    })
  }

  pub fn with_timeout(self, timeout: Duration) -> Result<Self, DetectionError> {
    Self::new(self.endpoint, timeout)
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  fn encode_data_url(image: &RgbImage) -> Result<String, DetectionError> {
    let mut buffer = Vec::new();
    image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)?;
    debug!(
      "上传图像大小: {:.2} KB",
      buffer.len() as f64 / 1024.0
    );
    Ok(format!(
      "data:image/jpeg;base64,{}",
      general_purpose::STANDARD.encode(&buffer)
    ))
  }
}

impl BoundaryDetector for RoboflowDetector {
  async fn detect(&self, image: &RgbImage) -> Result<Option<Detection>, DetectionError> {
    let body = Self::encode_data_url(image)?;

    info!("发送检测请求到: {}", self.endpoint.path());
    let response = self
      .client
      .post(self.endpoint.clone())
      .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
      .body(body)
      .send()
      .await?;

    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
      error!("检测服务返回错误状态: {}", status);
      return Err(DetectionError::Status {
        status: status.as_u16(),
        body: text,
      });
    }

    parse_predictions(&text)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roboflow_scheme_maps_to_https() {
    let url =
      Url::parse("roboflow://detect.roboflow.com/qr-code-detection-9y8lj/1?api_key=KEY").unwrap();
    let detector = RoboflowDetector::from_url(&url).unwrap();

    assert_eq!(
      detector.endpoint().as_str(),
      "https://detect.roboflow.com/qr-code-detection-9y8lj/1?api_key=KEY"
    );
    assert_eq!(detector.timeout(), DEFAULT_REQUEST_TIMEOUT);
  }

  #[test]
  fn plain_http_keeps_port() {
    let url = Url::parse("roboflow+http://localhost:9001/paper/3").unwrap();
    let detector = RoboflowDetector::from_url(&url).unwrap();
    assert_eq!(detector.endpoint().as_str(), "http://localhost:9001/paper/3");
  }

  #[test]
  fn other_scheme_is_rejected() {
    let url = Url::parse("https://detect.roboflow.com/model/1").unwrap();
    assert!(matches!(
      RoboflowDetector::from_url(&url),
      Err(DetectionError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn image_is_uploaded_as_jpeg_data_url() {
    let image = RgbImage::new(8, 8);
    let data_url = RoboflowDetector::encode_data_url(&image).unwrap();
    assert!(data_url.starts_with("data:image/jpeg;base64,/9j/"));
  }
}
