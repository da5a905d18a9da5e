//! `DB`: one private SQLite file per extension.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rquickjs::{Ctx, Function, Object};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Map, Value};

use super::CapabilityScope;
use crate::bridge::OpOutcome;

pub(crate) const DATABASE_FILE_NAME: &str = "ext.db";

/// Lazily opened connection to `<package>/.store/ext.db`.
#[derive(Clone)]
pub(crate) struct DatabaseHandle {
    path: PathBuf,
    connection: Arc<Mutex<Option<Connection>>>,
}

impl DatabaseHandle {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            connection: Arc::new(Mutex::new(None)),
        }
    }

    fn with_connection<T>(
        &self,
        operation: impl FnOnce(&Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| "database connection lock poisoned".to_string())?;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|error| format!("failed to create '{}': {error}", parent.display()))?;
            }
            let connection = Connection::open(&self.path)
                .map_err(|error| format!("failed to open database: {error}"))?;
            *guard = Some(connection);
        }
        let Some(connection) = guard.as_ref() else {
            return Err("database connection unavailable".to_string());
        };
        operation(connection)
    }

    /// Runs a statement and reports `{ rowsAffected }`. Without arguments
    /// the text may hold several `;`-separated statements.
    pub(crate) fn exec(&self, sql: &str, args: &[Value]) -> OpOutcome {
        self.with_connection(|connection| {
            let rows_affected = if args.is_empty() {
                connection
                    .execute_batch(sql)
                    .map_err(|error| error.to_string())?;
                connection.changes() as u64
            } else {
                connection
                    .execute(sql, params_from_iter(bind_arguments(args)))
                    .map_err(|error| error.to_string())? as u64
            };
            Ok(Some(json!({ "rowsAffected": rows_affected })))
        })
    }

    /// Runs a query and returns one object per row keyed by column name.
    pub(crate) fn query(&self, sql: &str, args: &[Value]) -> OpOutcome {
        self.with_connection(|connection| {
            let mut statement = connection
                .prepare(sql)
                .map_err(|error| error.to_string())?;
            let columns = statement
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>();
            let mut rows = statement
                .query(params_from_iter(bind_arguments(args)))
                .map_err(|error| error.to_string())?;

            let mut results = Vec::new();
            while let Some(row) = rows.next().map_err(|error| error.to_string())? {
                let mut object = Map::new();
                for (index, column) in columns.iter().enumerate() {
                    let value = row.get_ref(index).map_err(|error| error.to_string())?;
                    object.insert(column.clone(), column_value(value));
                }
                results.push(Value::Object(object));
            }
            Ok(Some(Value::Array(results)))
        })
    }
}

fn bind_arguments(args: &[Value]) -> Vec<SqlValue> {
    args.iter()
        .map(|arg| match arg {
            Value::Null => SqlValue::Null,
            Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => SqlValue::Integer(integer),
                None => SqlValue::Real(number.as_f64().unwrap_or_default()),
            },
            Value::String(text) => SqlValue::Text(text.clone()),
            other => SqlValue::Text(other.to_string()),
        })
        .collect()
}

fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => json!(integer),
        ValueRef::Real(real) => json!(real),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(STANDARD.encode(bytes)),
    }
}

fn decode_arguments(raw: &str) -> Result<Vec<Value>, String> {
    serde_json::from_str::<Vec<Value>>(raw)
        .map_err(|error| format!("DB: invalid query arguments: {error}"))
}

pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    host: &Object<'js>,
    scope: &Rc<CapabilityScope>,
) -> rquickjs::Result<()> {
    let exec_scope = Rc::clone(scope);
    host.set(
        "dbExec",
        Function::new(ctx.clone(), move |sql: String, args: String| {
            let bridge = &exec_scope.bridge;
            let args = match decode_arguments(&args) {
                Ok(args) => args,
                Err(message) => return bridge.reject(message) as f64,
            };
            let database = exec_scope.database.clone();
            bridge.spawn_blocking(move || database.exec(&sql, &args)) as f64
        })?,
    )?;

    let query_scope = Rc::clone(scope);
    host.set(
        "dbQuery",
        Function::new(ctx.clone(), move |sql: String, args: String| {
            let bridge = &query_scope.bridge;
            let args = match decode_arguments(&args) {
                Ok(args) => args,
                Err(message) => return bridge.reject(message) as f64,
            };
            let database = query_scope.database.clone();
            bridge.spawn_blocking(move || database.query(&sql, &args)) as f64
        })?,
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::{DatabaseHandle, DATABASE_FILE_NAME};

    #[test]
    fn functional_database_handle_creates_store_and_round_trips_rows() {
        let temp = tempdir().expect("tempdir");
        let store = temp.path().join(".store");
        let database = DatabaseHandle::new(store.join(DATABASE_FILE_NAME));

        database
            .exec(
                "CREATE TABLE hits (ip TEXT NOT NULL, seen INTEGER, flagged INTEGER, meta TEXT)",
                &[],
            )
            .expect("create table");
        let inserted = database
            .exec(
                "INSERT INTO hits (ip, seen, flagged, meta) VALUES (?, ?, ?, ?)",
                &[json!("1.2.3.4"), json!(3), json!(true), json!({"asn": 13335})],
            )
            .expect("insert row");
        assert_eq!(inserted, Some(json!({"rowsAffected": 1})));
        assert!(store.join(DATABASE_FILE_NAME).is_file());

        let rows = database
            .query("SELECT ip, seen, flagged, meta FROM hits WHERE ip = ?", &[json!("1.2.3.4")])
            .expect("query rows");
        assert_eq!(
            rows,
            Some(json!([{
                "ip": "1.2.3.4",
                "seen": 3,
                "flagged": 1,
                "meta": "{\"asn\":13335}"
            }]))
        );
    }

    #[test]
    fn unit_database_handle_encodes_blobs_as_base64() {
        let temp = tempdir().expect("tempdir");
        let database = DatabaseHandle::new(temp.path().join(DATABASE_FILE_NAME));
        let rows = database
            .query("SELECT x'00ff' AS raw, NULL AS missing", &[])
            .expect("query blob");
        assert_eq!(rows, Some(json!([{"raw": "AP8=", "missing": null}])));
    }

    #[test]
    fn regression_database_handle_reports_sql_errors_as_messages() {
        let temp = tempdir().expect("tempdir");
        let database = DatabaseHandle::new(temp.path().join(DATABASE_FILE_NAME));
        let error = database
            .query("SELECT * FROM missing_table", &[])
            .expect_err("missing table");
        assert!(error.contains("missing_table"));
    }
}
