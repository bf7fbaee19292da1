use std::cell::RefCell;
use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{Number, Value as JsonValue};
use tracing::warn;

use crate::error::WorkerError;

/// A script-opened sqlite database. Lives on the worker thread; the
/// environment force-closes any database a script left open when it shuts
/// down.
pub(crate) struct ScriptDatabase {
    name: String,
    connection: RefCell<Option<Connection>>,
}

impl ScriptDatabase {
    pub fn open(name: &str, path: &Path) -> Result<Self, WorkerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| WorkerError::Message(format!("failed to prepare database directory: {err}")))?;
        }
        let connection = Connection::open(path)
            .map_err(|err| WorkerError::Message(format!("failed to open database {name}: {err}")))?;
        Ok(ScriptDatabase {
            name: name.to_string(),
            connection: RefCell::new(Some(connection)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.connection.borrow().is_some()
    }

    /// Run one statement with JSON parameters, returning selected rows as an
    /// array of objects. Non-SELECT statements return an empty array.
    pub fn execute(&self, sql: &str, params: &[JsonValue]) -> Result<JsonValue, WorkerError> {
        let guard = self.connection.borrow();
        let connection = guard
            .as_ref()
            .ok_or_else(|| WorkerError::Message(format!("database {} is closed", self.name)))?;

        let mut statement = connection
            .prepare(sql)
            .map_err(|err| WorkerError::Message(format!("sqlite error: {err}")))?;
        let column_names: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(|name| name.to_string())
            .collect();

        let bound = params.iter().map(json_to_sql).collect::<Result<Vec<_>, _>>()?;
        let mut rows = statement
            .query(rusqlite::params_from_iter(bound))
            .map_err(|err| WorkerError::Message(format!("sqlite error: {err}")))?;

        let mut results = Vec::new();
        loop {
            let row = match rows.next() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(err) => return Err(WorkerError::Message(format!("sqlite error: {err}"))),
            };
            let mut object = serde_json::Map::new();
            for (index, column) in column_names.iter().enumerate() {
                let value = row
                    .get_ref(index)
                    .map_err(|err| WorkerError::Message(format!("sqlite error: {err}")))?;
                object.insert(column.clone(), sql_to_json(value));
            }
            results.push(JsonValue::Object(object));
        }
        Ok(JsonValue::Array(results))
    }

    pub fn close(&self) {
        if let Some(connection) = self.connection.borrow_mut().take() {
            if let Err((_, err)) = connection.close() {
                warn!(target: "worker", database = %self.name, %err, "error closing database");
            }
        }
    }

    pub fn force_close(&self) {
        self.close();
    }
}

fn json_to_sql(value: &JsonValue) -> Result<rusqlite::types::Value, WorkerError> {
    use rusqlite::types::Value as SqlValue;
    match value {
        JsonValue::Null => Ok(SqlValue::Null),
        JsonValue::Bool(flag) => Ok(SqlValue::Integer(*flag as i64)),
        JsonValue::Number(number) => {
            if let Some(integer) = number.as_i64() {
                Ok(SqlValue::Integer(integer))
            } else if let Some(float) = number.as_f64() {
                Ok(SqlValue::Real(float))
            } else {
                Err(WorkerError::Message(format!("unsupported number parameter: {number}")))
            }
        }
        JsonValue::String(text) => Ok(SqlValue::Text(text.clone())),
        other => Err(WorkerError::Message(format!(
            "unsupported database parameter: {other}"
        ))),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(integer) => JsonValue::Number(integer.into()),
        ValueRef::Real(float) => Number::from_f64(float)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(text) => JsonValue::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => JsonValue::Array(
            blob.iter()
                .map(|byte| JsonValue::Number((*byte).into()))
                .collect(),
        ),
    }
}
