//! Postgres-backed page reader.
//!
//! Builds a `LIMIT`/`OFFSET` query over the configured view with the
//! configured stable order, and decodes each column dynamically into a
//! JSON value so translators can work without a compile-time schema.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::{BigDecimal, Uuid};
use sqlx::{Column as _, Row as _, TypeInfo as _};

use super::PageReader;
use crate::error::{Error, Result};
use crate::pg::{store_err, validate_identifier, validate_order_by};
use crate::row::{Row, RowColumn};

/// Page reader over a Postgres view.
#[derive(Debug, Clone)]
pub struct PostgresPageReader {
    pool: PgPool,
    view: String,
    order_by: String,
    page_size: u64,
}

impl PostgresPageReader {
    /// Creates a reader over the given pool, view, and order.
    ///
    /// `order_by` must describe a total order on the view; ties in the
    /// sort key make offset pagination unsound.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the view name or order-by
    /// fragment fails validation, or if `page_size` is zero.
    pub fn new(pool: PgPool, view: &str, order_by: &str, page_size: u64) -> Result<Self> {
        validate_identifier(view)?;
        validate_order_by(order_by)?;
        if page_size == 0 {
            return Err(Error::configuration("page_size must be positive"));
        }

        Ok(Self {
            pool,
            view: view.to_string(),
            order_by: order_by.to_string(),
            page_size,
        })
    }

    fn decode_row(row: &PgRow) -> Row {
        let columns = row
            .columns()
            .iter()
            .map(|column| {
                let value = decode_column(row, column.ordinal(), column.type_info().name());
                RowColumn::new(column.name(), value)
            })
            .collect();

        Row::new(columns)
    }
}

/// Decodes one column into a JSON value by Postgres type name.
///
/// Unknown types fall back to a text read, then to NULL.
fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Value {
    fn num(value: f64) -> Value {
        serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
    }

    match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .map(|v| v.map_or(Value::Null, Value::Bool))
            .unwrap_or(Value::Null),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map(|v| v.map_or(Value::Null, |n| Value::from(i64::from(n))))
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map(|v| v.map_or(Value::Null, |n| Value::from(i64::from(n))))
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .map(|v| v.map_or(Value::Null, Value::from))
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .map(|v| v.map_or(Value::Null, |n| num(f64::from(n))))
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(index)
            .map(|v| v.map_or(Value::Null, num))
            .unwrap_or(Value::Null),
        "NUMERIC" => row
            .try_get::<Option<BigDecimal>, _>(index)
            .map(|v| {
                v.map_or(Value::Null, |dec| {
                    let text = dec.to_string();
                    text.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map_or_else(|| Value::String(text), num)
                })
            })
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .map(|v| {
                v.map_or(Value::Null, |at| {
                    Value::String(at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
                })
            })
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map(|v| v.map_or(Value::Null, |at| Value::String(at.to_string())))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)
            .map(|v| v.map_or(Value::Null, |d| Value::String(d.to_string())))
            .unwrap_or(Value::Null),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(index)
            .map(|v| v.map_or(Value::Null, |t| Value::String(t.to_string())))
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<Uuid>, _>(index)
            .map(|v| v.map_or(Value::Null, |u| Value::String(u.to_string())))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .map(|v| v.unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        other => row
            .try_get::<Option<String>, _>(index)
            .map(|v| v.map_or(Value::Null, Value::String))
            .unwrap_or_else(|_| {
                tracing::debug!(column_type = other, "undecodable column type; emitting NULL");
                Value::Null
            }),
    }
}

#[async_trait]
impl PageReader for PostgresPageReader {
    async fn read_page(&self, page: u64) -> Result<Vec<Row>> {
        let offset = i64::try_from(page.saturating_mul(self.page_size)).unwrap_or(i64::MAX);
        let limit = i64::try_from(self.page_size).unwrap_or(i64::MAX);

        let rows = sqlx::query(&format!(
            "SELECT * FROM {} ORDER BY {} LIMIT $1 OFFSET $2",
            self.view, self.order_by
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::PageRead {
            page,
            message: e.to_string(),
        })?;

        Ok(rows.iter().map(Self::decode_row).collect())
    }

    async fn total_rows(&self) -> Result<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS total FROM {}", self.view))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_err("count view rows", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| store_err("decode view row count", e))?;

        Ok(u64::try_from(total).unwrap_or(0))
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }
}
