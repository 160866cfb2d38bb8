//! Column decoding that reports which table and column held bad data.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::FromSql;
use rusqlite::Row;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Reads typed columns from one row of `table`. Every failure becomes
/// [`StoreError::CorruptRow`] naming the offending column.
pub struct RowReader<'a, 'stmt> {
    row: &'a Row<'stmt>,
    table: &'static str,
}

impl<'a, 'stmt> RowReader<'a, 'stmt> {
    pub fn new(row: &'a Row<'stmt>, table: &'static str) -> Self {
        Self { row, table }
    }

    fn corrupt(&self, column: &'static str, detail: String) -> StoreError {
        StoreError::CorruptRow {
            table: self.table,
            column,
            detail,
        }
    }

    pub fn get<T: FromSql>(&self, idx: usize, column: &'static str) -> Result<T, StoreError> {
        self.row
            .get(idx)
            .map_err(|e| self.corrupt(column, e.to_string()))
    }

    /// A JSON text column.
    pub fn json<T: DeserializeOwned>(&self, idx: usize, column: &'static str) -> Result<T, StoreError> {
        let raw: String = self.get(idx, column)?;
        decode_json(&raw).map_err(|detail| self.corrupt(column, detail))
    }

    /// A text column holding a `FromStr` value such as an enum tag.
    pub fn parsed<T: FromStr>(&self, idx: usize, column: &'static str) -> Result<T, StoreError> {
        let raw: String = self.get(idx, column)?;
        raw.parse()
            .map_err(|_| self.corrupt(column, format!("unknown value: {raw}")))
    }

    /// An RFC 3339 timestamp column.
    pub fn time(&self, idx: usize, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
        let raw: String = self.get(idx, column)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| self.corrupt(column, format!("invalid timestamp: {e}")))
    }
}

fn decode_json<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))
}

/// Decode a JSON column value read outside a [`RowReader`].
pub fn json_column<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    decode_json(raw).map_err(|detail| StoreError::CorruptRow {
        table,
        column,
        detail,
    })
}
