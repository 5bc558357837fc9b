// 该文件是 Zhiyin （纸印） 项目的一部分。
// src/qr/remote.rs - 远程二维码识别服务
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

use image::{ImageFormat, RgbImage};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::{DEFAULT_REQUEST_TIMEOUT, rebase_endpoint},
  qr::{QrDecoder, QrError},
};

pub(crate) const REMOTE_QR_PLAIN_HTTP_SCHEME: &str = "qr+http";

#[derive(Debug, Deserialize)]
struct DecodeResponse {
  #[serde(default)]
  payload: Option<String>,
}

/// 以 PNG 上传图像，服务端返回 `{"payload": "..."}` 或 `{"payload": null}`
#[derive(Debug, Clone)]
pub struct RemoteQrDecoder {
  client: reqwest::Client,
  endpoint: Url,
}

impl FromUrlWithScheme for RemoteQrDecoder {
  const SCHEME: &'static str = "qr+https";
}

impl FromUrl for RemoteQrDecoder {
  type Error = QrError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let protocol = match url.scheme() {
      Self::SCHEME => "https",
      REMOTE_QR_PLAIN_HTTP_SCHEME => "http",
      other => {
        error!(
          "URI scheme mismatch: expected '{}', found '{}'",
          Self::SCHEME,
          other
        );
        return Err(QrError::SchemeMismatch);
      }
    };

    let endpoint = rebase_endpoint(url, protocol)?;
    Self::new(endpoint, DEFAULT_REQUEST_TIMEOUT)
  }
}

impl RemoteQrDecoder {
  pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, QrError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client, endpoint })
  }

  pub fn with_timeout(self, timeout: Duration) -> Result<Self, QrError> {
    Self::new(self.endpoint, timeout)
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }
}

fn parse_payload(body: &str) -> Result<Option<String>, QrError> {
  let response: DecodeResponse = serde_json::from_str(body)?;
  Ok(response.payload)
}

impl QrDecoder for RemoteQrDecoder {
  async fn decode(&self, image: &RgbImage) -> Result<Option<String>, QrError> {
    let mut buffer = Vec::new();
    image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;

    info!("发送二维码识别请求到: {}", self.endpoint.path());
    let response = self
      .client
      .post(self.endpoint.clone())
      .header(CONTENT_TYPE, "image/png")
      .body(buffer)
      .send()
      .await?;

    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
      error!("识别服务返回错误状态: {}", status);
      return Err(QrError::Status {
        status: status.as_u16(),
        body: text,
      });
    }

    let payload = parse_payload(&text)?;
    debug!("远程二维码识别结果: {:?}", payload);
    Ok(payload)
  }
}
