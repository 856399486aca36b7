use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use tracing::debug;

use crate::handler::{AttemptContext, HandlerDescriptor, TaskHandler, TaskOutput};

const DEFAULT_QUERY: &str = "SELECT key, payload FROM records";
const DEFAULT_TARGET_TABLE: &str = "replicated_records";

/// 在两个 SQLite 库之间复制 key/payload 记录
///
/// 参数：`source_url`、`target_url`，可选 `query`（返回 key, payload 两列）
/// 与 `target_table`。目标写入在单个事务中完成。
pub struct DataReplicationHandler;

fn validate_identifier(name: &str) -> anyhow::Result<&str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(anyhow!("invalid target table name: {name}"))
    }
}

#[async_trait]
impl TaskHandler for DataReplicationHandler {
    fn key(&self) -> &'static str {
        "data_replication"
    }

    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            version: 1,
            name_en: "Data replication".to_string(),
            name_ar: "نسخ البيانات".to_string(),
            description: Some("Copies key/payload rows from a source database into a target table".to_string()),
        }
    }

    async fn run(&self, attempt: &AttemptContext<'_>) -> anyhow::Result<TaskOutput> {
        let source_url = attempt
            .param_str("source_url")
            .ok_or_else(|| anyhow!("missing parameter: source_url"))?;
        let target_url = attempt
            .param_str("target_url")
            .ok_or_else(|| anyhow!("missing parameter: target_url"))?;
        let query = attempt.param_str("query").unwrap_or(DEFAULT_QUERY);
        let table = validate_identifier(
            attempt
                .param_str("target_table")
                .unwrap_or(DEFAULT_TARGET_TABLE),
        )?;

        let source = attempt.scope.sqlite_pool("replication-source", source_url).await?;
        let target = attempt.scope.sqlite_pool("replication-target", target_url).await?;

        let rows = sqlx::query(query)
            .fetch_all(&source)
            .await
            .context("读取源数据失败")?;

        let mut tx = target.begin().await.context("开启目标事务失败")?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (key TEXT PRIMARY KEY, payload TEXT, replicated_at TEXT NOT NULL)"
        ))
        .execute(&mut *tx)
        .await?;

        let replicated_at = Utc::now();
        let upsert = format!(
            "INSERT INTO {table} (key, payload, replicated_at) VALUES ($1, $2, $3) \
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, replicated_at = excluded.replicated_at"
        );
        let copied = async {
            for row in &rows {
                if attempt.soft_limit_reached() {
                    bail!("soft time limit reached after partial copy; changes rolled back");
                }
                let key: String = row.try_get(0).context("源数据缺少 key 列")?;
                let payload: Option<String> = row.try_get(1).context("源数据缺少 payload 列")?;
                sqlx::query(&upsert)
                    .bind(key)
                    .bind(payload)
                    .bind(replicated_at)
                    .execute(&mut *tx)
                    .await?;
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;
        if let Err(e) = copied {
            if let Err(rollback) = tx.rollback().await {
                debug!("回滚目标事务失败: {}", rollback);
            }
            return Err(e);
        }

        tx.commit().await.context("提交目标事务失败")?;
        debug!(rows = rows.len(), table, "数据复制完成");

        Ok(TaskOutput::new(format!(
            "replicated {} rows into {table}",
            rows.len()
        )))
    }
}
