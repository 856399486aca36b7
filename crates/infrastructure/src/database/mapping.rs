//! 行映射辅助：SQLite 中以 TEXT 存储的 UUID 与 JSON 字段

use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn parse_uuid(row: &SqliteRow, field_name: &str) -> SchedulerResult<Uuid> {
        let raw: String = row.try_get(field_name)?;
        Uuid::parse_str(&raw)
            .map_err(|e| SchedulerError::Serialization(format!("解析{field_name}失败: {e}")))
    }

    pub fn parse_optional_uuid(row: &SqliteRow, field_name: &str) -> SchedulerResult<Option<Uuid>> {
        let raw: Option<String> = row.try_get(field_name)?;
        raw.map(|value| {
            Uuid::parse_str(&value)
                .map_err(|e| SchedulerError::Serialization(format!("解析{field_name}失败: {e}")))
        })
        .transpose()
    }

    pub fn parse_parameters(row: &SqliteRow, field_name: &str) -> SchedulerResult<serde_json::Value> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| SchedulerError::Serialization(format!("解析参数失败: {e}")))
    }
}
