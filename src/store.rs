// 该文件是 Zhiyin （纸印） 项目的一部分。
// src/store.rs - 纸张制品持久化
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

use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::{
  FromRow,
  sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

const FILE_POOL_SIZE: u32 = 4;
const IN_MEMORY_MARKER: &str = ":memory:";

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("数据库错误: {0}")]
  Database(#[from] sqlx::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("标识符不能为空")]
  EmptyIdentifier,
  #[error("数字标识符已达上限: {0}")]
  IdentifierExhausted(i64),
}

/// 对应一张实体纸张的持久标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(String);

impl Identifier {
  pub fn new(value: impl Into<String>) -> Result<Self, StoreError> {
    let value = value.into();
    if value.is_empty() {
      return Err(StoreError::EmptyIdentifier);
    }
    Ok(Self(value))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// 规范十进制非负整数（无前导零）才参与自增分配
  pub fn numeric(&self) -> Option<i64> {
    let s = self.0.as_str();
    let canonical = !s.is_empty()
      && s.bytes().all(|b| b.is_ascii_digit())
      && (s == "0" || !s.starts_with('0'));
    if canonical { s.parse().ok() } else { None }
  }
}

impl From<i64> for Identifier {
  fn from(value: i64) -> Self {
    Self(value.to_string())
  }
}

impl fmt::Display for Identifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// 持久化单元：标识符、源文件名、源图像字节与网格矩阵字节
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
  pub row_id: i64,
  pub identifier: Identifier,
  pub filename: String,
  pub image: Vec<u8>,
  pub matrix: Vec<u8>,
  pub created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct ArtifactRow {
  id: i64,
  identifier: String,
  filename: String,
  image: Vec<u8>,
  matrix: Vec<u8>,
  created_at: DateTime<Utc>,
}

impl From<ArtifactRow> for Artifact {
  fn from(row: ArtifactRow) -> Self {
    Artifact {
      row_id: row.id,
      identifier: Identifier(row.identifier),
      filename: row.filename,
      image: row.image,
      matrix: row.matrix,
      created_at: row.created_at,
    }
  }
}

pub struct ArtifactStoreBuilder {
  connection: String,
}

impl FromUrlWithScheme for ArtifactStoreBuilder {
  const SCHEME: &'static str = "sqlite";
}

impl FromUrl for ArtifactStoreBuilder {
  type Error = StoreError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(StoreError::SchemeMismatch(format!(
        "期望存储方式 '{}', 实际存储方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }
    Ok(ArtifactStoreBuilder {
      connection: url.as_str().to_string(),
    })
  }
}

impl ArtifactStoreBuilder {
  pub async fn build(self) -> Result<ArtifactStore, StoreError> {
    ArtifactStore::open(&self.connection).await
  }
}

async fn max_numeric_key(conn: &mut SqliteConnection) -> Result<Option<i64>, StoreError> {
  let max: Option<i64> = sqlx::query_scalar("SELECT MAX(numeric_key) FROM artifacts")
    .fetch_one(&mut *conn)
    .await?;
  Ok(max)
}

fn successor(max: Option<i64>) -> Result<Identifier, StoreError> {
  match max {
    None => Ok(Identifier::from(1)),
    Some(max) => max
      .checked_add(1)
      .map(Identifier::from)
      .ok_or(StoreError::IdentifierExhausted(max)),
  }
}

async fn append(
  conn: &mut SqliteConnection,
  identifier: &Identifier,
  filename: &str,
  image: &[u8],
  matrix: &[u8],
) -> Result<(), StoreError> {
  sqlx::query(
    "INSERT INTO artifacts (identifier, numeric_key, filename, image, matrix, created_at)
     VALUES (?, ?, ?, ?, ?, ?)",
  )
  .bind(identifier.as_str())
  .bind(identifier.numeric())
  .bind(filename)
  .bind(image)
  .bind(matrix)
  .bind(Utc::now())
  .execute(&mut *conn)
  .await
  .inspect_err(|e| error!("写入制品失败: {}", e))?;
  Ok(())
}

const SELECT_ARTIFACT: &str =
  "SELECT id, identifier, filename, image, matrix, created_at FROM artifacts";

/// 标识符到 (源图像, 矩阵) 的持久映射，只追加不覆盖
#[derive(Clone)]
pub struct ArtifactStore {
  pool: SqlitePool,
  // 同一进程内的写入串行化，分配与插入在同一事务中完成
  writer: Arc<Mutex<()>>,
}

impl ArtifactStore {
  pub async fn open(connection: &str) -> Result<Self, StoreError> {
    info!("打开制品数据库: {}", connection);
    let options = SqliteConnectOptions::from_str(connection)?.create_if_missing(true);

    // 内存数据库只在单个连接存活期间存在
    let pool_options = if connection.contains(IN_MEMORY_MARKER) {
      SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
    } else {
      SqlitePoolOptions::new().max_connections(FILE_POOL_SIZE)
    };
    let pool = pool_options.connect_with(options).await?;

    let store = Self {
      pool,
      writer: Arc::new(Mutex::new(())),
    };
    store.migrate().await?;
    Ok(store)
  }

  pub async fn in_memory() -> Result<Self, StoreError> {
    Self::open("sqlite::memory:").await
  }

  async fn migrate(&self) -> Result<(), StoreError> {
    sqlx::query(
      "CREATE TABLE IF NOT EXISTS artifacts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        identifier TEXT NOT NULL,
        numeric_key INTEGER,
        filename TEXT NOT NULL,
        image BLOB NOT NULL,
        matrix BLOB NOT NULL,
        created_at TEXT NOT NULL
      )",
    )
    .execute(&self.pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS artifacts_identifier ON artifacts (identifier)")
      .execute(&self.pool)
      .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS artifacts_numeric_key ON artifacts (numeric_key)")
      .execute(&self.pool)
      .await?;
    debug!("制品表结构就绪");
    Ok(())
  }

  /// 当前最大数字标识符加一，空库返回 1；每次调用都读取持久化状态
  pub async fn next_identifier(&self) -> Result<Identifier, StoreError> {
    let mut conn = self.pool.acquire().await?;
    successor(max_numeric_key(&mut conn).await?)
  }

  /// 追加一条记录并返回使用的标识符；未给出标识符时原子地分配下一个
  pub async fn insert(
    &self,
    identifier: Option<&Identifier>,
    filename: &str,
    image: &[u8],
    matrix: &[u8],
  ) -> Result<Identifier, StoreError> {
    let _guard = self.writer.lock().await;
    let mut tx = self.pool.begin().await?;

    let identifier = match identifier {
      Some(identifier) => identifier.clone(),
      None => successor(max_numeric_key(&mut tx).await?)?,
    };
    append(&mut tx, &identifier, filename, image, matrix).await?;
    tx.commit().await?;

    info!("保存制品 {} ({})", identifier, filename);
    Ok(identifier)
  }

  /// 已有该标识符时返回 `(标识符, false)`，否则写入新记录并返回 `(标识符, true)`
  ///
  /// 查找与写入在同一事务内完成，同一张纸并发识别只会产生一条记录。
  pub async fn find_or_insert(
    &self,
    identifier: Option<&Identifier>,
    filename: &str,
    image: &[u8],
    matrix: &[u8],
  ) -> Result<(Identifier, bool), StoreError> {
    let _guard = self.writer.lock().await;
    let mut tx = self.pool.begin().await?;

    let identifier = match identifier {
      Some(identifier) => {
        let existing: Option<i64> =
          sqlx::query_scalar("SELECT id FROM artifacts WHERE identifier = ? LIMIT 1")
            .bind(identifier.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
          debug!("制品已存在: {}", identifier);
          return Ok((identifier.clone(), false));
        }
        identifier.clone()
      }
      None => successor(max_numeric_key(&mut tx).await?)?,
    };
    append(&mut tx, &identifier, filename, image, matrix).await?;
    tx.commit().await?;

    info!("保存制品 {} ({})", identifier, filename);
    Ok((identifier, true))
  }

  /// 返回该标识符最早写入的记录
  pub async fn lookup(&self, identifier: &Identifier) -> Result<Option<Artifact>, StoreError> {
    let row: Option<ArtifactRow> = sqlx::query_as(&format!(
      "{} WHERE identifier = ? ORDER BY id ASC LIMIT 1",
      SELECT_ARTIFACT
    ))
    .bind(identifier.as_str())
    .fetch_optional(&self.pool)
    .await?;
    Ok(row.map(Artifact::from))
  }

  pub async fn latest(&self) -> Result<Option<Artifact>, StoreError> {
    let row: Option<ArtifactRow> =
      sqlx::query_as(&format!("{} ORDER BY id DESC LIMIT 1", SELECT_ARTIFACT))
        .fetch_optional(&self.pool)
        .await?;
    Ok(row.map(Artifact::from))
  }

  pub async fn count(&self) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artifacts")
      .fetch_one(&self.pool)
      .await?;
    Ok(count)
  }

  pub async fn close(&self) {
    self.pool.close().await;
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeSet;

  use super::*;

  fn id(value: &str) -> Identifier {
    Identifier::new(value).unwrap()
  }

  #[test]
  fn numeric_identifiers_must_be_canonical() {
    assert_eq!(id("42").numeric(), Some(42));
    assert_eq!(id("0").numeric(), Some(0));
    assert_eq!(id("042").numeric(), None);
    assert_eq!(id("-3").numeric(), None);
    assert_eq!(id("QR-1700000000").numeric(), None);
    assert_eq!(id("99999999999999999999").numeric(), None);
    assert!(matches!(
      Identifier::new(""),
      Err(StoreError::EmptyIdentifier)
    ));
  }

  #[test]
  fn builder_requires_sqlite_scheme() {
    let url = Url::parse("postgres://localhost/db").unwrap();
    assert!(matches!(
      ArtifactStoreBuilder::from_url(&url),
      Err(StoreError::SchemeMismatch(_))
    ));
  }

  #[tokio::test]
  async fn empty_store_starts_at_one() {
    let store = ArtifactStore::in_memory().await.unwrap();
    assert_eq!(store.next_identifier().await.unwrap(), id("1"));
    assert_eq!(store.latest().await.unwrap(), None);
    assert_eq!(store.count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn blobs_round_trip_byte_for_byte() {
    let store = ArtifactStore::in_memory().await.unwrap();
    let image: Vec<u8> = (0..=255).collect();
    let matrix = b"111\n111".to_vec();

    let assigned = store.insert(None, "a.png", &image, &matrix).await.unwrap();
    assert_eq!(assigned, id("1"));

    let artifact = store.lookup(&assigned).await.unwrap().unwrap();
    assert_eq!(artifact.filename, "a.png");
    assert_eq!(artifact.image, image);
    assert_eq!(artifact.matrix, matrix);
    assert_eq!(store.lookup(&id("2")).await.unwrap(), None);
  }

  #[tokio::test]
  async fn next_identifier_follows_numeric_maximum() {
    let store = ArtifactStore::in_memory().await.unwrap();
    store.insert(Some(&id("41")), "a.png", b"a", b"1").await.unwrap();
    store.insert(Some(&id("paper-x")), "b.png", b"b", b"1").await.unwrap();

    assert_eq!(store.next_identifier().await.unwrap(), id("42"));
    assert_eq!(store.insert(None, "c.png", b"c", b"1").await.unwrap(), id("42"));
    assert_eq!(store.next_identifier().await.unwrap(), id("43"));
  }

  #[tokio::test]
  async fn colliding_insert_appends_and_lookup_keeps_first() {
    let store = ArtifactStore::in_memory().await.unwrap();
    store.insert(Some(&id("7")), "first.png", b"one", b"1").await.unwrap();
    store.insert(Some(&id("7")), "second.png", b"two", b"1").await.unwrap();

    assert_eq!(store.count().await.unwrap(), 2);
    let artifact = store.lookup(&id("7")).await.unwrap().unwrap();
    assert_eq!(artifact.filename, "first.png");
    let latest = store.latest().await.unwrap().unwrap();
    assert_eq!(latest.filename, "second.png");
  }

  #[tokio::test]
  async fn file_store_survives_reopen() {
    let path = std::env::temp_dir().join(format!(
      "zhiyin-store-{}-{}.sqlite",
      std::process::id(),
      Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let connection = format!("sqlite://{}", path.display());

    let store = ArtifactStore::open(&connection).await.unwrap();
    store.insert(None, "a.png", b"a", b"1").await.unwrap();
    store.insert(None, "b.png", b"b", b"1").await.unwrap();
    store.close().await;

    let reopened = ArtifactStore::open(&connection).await.unwrap();
    assert_eq!(reopened.next_identifier().await.unwrap(), id("3"));
    reopened.close().await;
    let _ = std::fs::remove_file(&path);
  }

  #[tokio::test]
  async fn largest_numeric_identifier_stops_assignment() {
    let store = ArtifactStore::in_memory().await.unwrap();
    let largest = Identifier::from(i64::MAX);
    store.insert(Some(&largest), "max.png", b"m", b"1").await.unwrap();

    assert!(matches!(
      store.next_identifier().await,
      Err(StoreError::IdentifierExhausted(i64::MAX))
    ));
    for _ in 0..2 {
      assert!(matches!(
        store.insert(None, "next.png", b"n", b"1").await,
        Err(StoreError::IdentifierExhausted(_))
      ));
    }
    assert_eq!(store.count().await.unwrap(), 1);

    // 非数字标识符不受影响
    store.insert(Some(&id("paper-x")), "x.png", b"x", b"1").await.unwrap();
    assert_eq!(store.count().await.unwrap(), 2);
  }

  #[tokio::test]
  async fn find_or_insert_reports_existing_records() {
    let store = ArtifactStore::in_memory().await.unwrap();

    let (first, is_new) = store
      .find_or_insert(Some(&id("paper-3")), "a.png", b"a", b"1")
      .await
      .unwrap();
    assert_eq!((first.as_str(), is_new), ("paper-3", true));

    let (again, is_new) = store
      .find_or_insert(Some(&id("paper-3")), "b.png", b"b", b"1")
      .await
      .unwrap();
    assert_eq!((again.as_str(), is_new), ("paper-3", false));
    assert_eq!(store.count().await.unwrap(), 1);

    let (assigned, is_new) = store.find_or_insert(None, "c.png", b"c", b"1").await.unwrap();
    assert_eq!((assigned, is_new), (id("1"), true));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_inserts_get_distinct_identifiers() {
    const N: i64 = 16;
    let store = ArtifactStore::in_memory().await.unwrap();

    let handles: Vec<_> = (0..N)
      .map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
          store
            .insert(None, &format!("{}.png", i), b"img", b"1")
            .await
            .unwrap()
        })
      })
      .collect();

    let mut assigned = BTreeSet::new();
    for handle in handles {
      assigned.insert(handle.await.unwrap().numeric().unwrap());
    }
    assert_eq!(assigned, (1..=N).collect::<BTreeSet<_>>());
  }
}
