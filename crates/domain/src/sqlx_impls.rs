//! # SQLx 数据库类型转换实现
//!
//! 领域枚举以 TEXT 列存储，编码使用 `as_str`，解码使用 `FromStr`。

use crate::entities::{ExecutionStatus, InstanceMode, InstanceStatus, JobKind, TriggerSource};

macro_rules! impl_sqlite_text_enum {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl sqlx::Type<sqlx::Sqlite> for $ty {
                fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                    <str as sqlx::Type<sqlx::Sqlite>>::type_info()
                }

                fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                    <str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
                }
            }

            impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $ty {
                fn decode(
                    value: sqlx::sqlite::SqliteValueRef<'r>,
                ) -> Result<Self, sqlx::error::BoxDynError> {
                    let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                    s.parse::<$ty>().map_err(Into::into)
                }
            }

            impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $ty {
                fn encode_by_ref(
                    &self,
                    buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
                ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                    <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
                }
            }
        )+
    };
}

impl_sqlite_text_enum!(
    JobKind,
    ExecutionStatus,
    TriggerSource,
    InstanceMode,
    InstanceStatus,
);
