//! 单次尝试的外部资源作用域
//!
//! 每次尝试可能运行在新建的运行时中，连接池与客户端只在本次尝试内有效，
//! 尝试结束时（无论成败）统一释放。

use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

enum ScopedResource {
    SqlitePool { label: String, pool: SqlitePool },
    HttpClient { label: String, client: reqwest::Client },
}

impl ScopedResource {
    fn label(&self) -> &str {
        match self {
            ScopedResource::SqlitePool { label, .. } | ScopedResource::HttpClient { label, .. } => {
                label
            }
        }
    }

    async fn dispose(self) {
        match self {
            ScopedResource::SqlitePool { pool, .. } => pool.close().await,
            // reqwest 客户端的连接池随最后一个句柄释放
            ScopedResource::HttpClient { client, .. } => drop(client),
        }
    }
}

#[derive(Default)]
pub struct AttemptScope {
    resources: Mutex<Vec<ScopedResource>>,
}

impl AttemptScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开仅在本次尝试内使用的 SQLite 连接池
    pub async fn sqlite_pool(&self, label: &str, url: &str) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("无效的数据库URL: {url}"))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("连接数据库失败: {label}"))?;

        self.push(ScopedResource::SqlitePool {
            label: label.to_string(),
            pool: pool.clone(),
        });
        Ok(pool)
    }

    /// 构建仅在本次尝试内使用的 HTTP 客户端
    pub fn http_client(&self, label: &str, timeout: Duration) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("构建HTTP客户端失败")?;

        self.push(ScopedResource::HttpClient {
            label: label.to_string(),
            client: client.clone(),
        });
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.resources.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 释放所有资源，返回释放数量
    pub async fn dispose_all(&self) -> usize {
        let resources = match self.resources.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let count = resources.len();
        for resource in resources.into_iter().rev() {
            debug!(resource = resource.label(), "释放尝试资源");
            resource.dispose().await;
        }
        count
    }

    fn push(&self, resource: ScopedResource) {
        match self.resources.lock() {
            Ok(mut guard) => guard.push(resource),
            Err(poisoned) => poisoned.into_inner().push(resource),
        }
    }
}
