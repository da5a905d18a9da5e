//! `storage`: flat files in the extension's private `.store` directory.

use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use rquickjs::{Ctx, Function, Object};
use serde_json::Value;

use super::sql::DATABASE_FILE_NAME;
use super::CapabilityScope;
use crate::bridge::OpOutcome;

const DATABASE_SIDECAR_SUFFIXES: &[&str] = &["", "-journal", "-wal", "-shm"];

/// Accepts only a single plain file name that is not the `DB` file or one
/// of its SQLite sidecars.
pub(crate) fn validate_storage_file_name(name: &str) -> Result<(), String> {
    let mut components = Path::new(name).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if name.is_empty() || !single_normal || name.contains(['/', '\\']) {
        return Err(format!(
            "storage: '{name}' is not a plain file name inside the extension store"
        ));
    }
    let reserved = name
        .strip_prefix(DATABASE_FILE_NAME)
        .is_some_and(|suffix| DATABASE_SIDECAR_SUFFIXES.contains(&suffix));
    if reserved {
        return Err(format!("storage: '{name}' is reserved for the extension database"));
    }
    Ok(())
}

fn store_path(store_dir: &Path, name: &str) -> Result<PathBuf, String> {
    validate_storage_file_name(name)?;
    Ok(store_dir.join(name))
}

async fn init_store(store_dir: PathBuf) -> OpOutcome {
    tokio::fs::create_dir_all(&store_dir)
        .await
        .map_err(|error| format!("storage.init: {error}"))?;
    Ok(None)
}

async fn save_file(store_dir: PathBuf, path: PathBuf, name: String, contents: String) -> OpOutcome {
    tokio::fs::create_dir_all(&store_dir)
        .await
        .map_err(|error| format!("storage.save: {error}"))?;
    tokio::fs::write(&path, contents)
        .await
        .map_err(|error| format!("storage.save '{name}': {error}"))?;
    Ok(None)
}

async fn read_file(path: PathBuf, name: String) -> OpOutcome {
    let contents = tokio::fs::read_to_string(&path)
        .await
        .map_err(|error| format!("storage.read '{name}': {error}"))?;
    Ok(Some(Value::String(contents)))
}

async fn remove_file(path: PathBuf, name: String) -> OpOutcome {
    tokio::fs::remove_file(&path)
        .await
        .map_err(|error| format!("storage.remove '{name}': {error}"))?;
    Ok(None)
}

pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    host: &Object<'js>,
    scope: &Rc<CapabilityScope>,
) -> rquickjs::Result<()> {
    let init_scope = Rc::clone(scope);
    host.set(
        "storageInit",
        Function::new(ctx.clone(), move || {
            init_scope
                .bridge
                .spawn(init_store(init_scope.store_dir.clone())) as f64
        })?,
    )?;

    let save_scope = Rc::clone(scope);
    host.set(
        "storageSave",
        Function::new(ctx.clone(), move |name: String, contents: String| {
            let bridge = &save_scope.bridge;
            let path = match store_path(&save_scope.store_dir, &name) {
                Ok(path) => path,
                Err(message) => return bridge.reject(message) as f64,
            };
            bridge.spawn(save_file(save_scope.store_dir.clone(), path, name, contents)) as f64
        })?,
    )?;

    let read_scope = Rc::clone(scope);
    host.set(
        "storageRead",
        Function::new(ctx.clone(), move |name: String| {
            let bridge = &read_scope.bridge;
            let path = match store_path(&read_scope.store_dir, &name) {
                Ok(path) => path,
                Err(message) => return bridge.reject(message) as f64,
            };
            bridge.spawn(read_file(path, name)) as f64
        })?,
    )?;

    let remove_scope = Rc::clone(scope);
    host.set(
        "storageRemove",
        Function::new(ctx.clone(), move |name: String| {
            let bridge = &remove_scope.bridge;
            let path = match store_path(&remove_scope.store_dir, &name) {
                Ok(path) => path,
                Err(message) => return bridge.reject(message) as f64,
            };
            bridge.spawn(remove_file(path, name)) as f64
        })?,
    )
}

#[cfg(test)]
mod tests {
    use super::validate_storage_file_name;

    #[test]
    fn unit_validate_storage_file_name_accepts_plain_names() {
        assert!(validate_storage_file_name("state.json").is_ok());
        assert!(validate_storage_file_name(".hidden").is_ok());
    }

    #[test]
    fn regression_validate_storage_file_name_rejects_traversal() {
        for name in ["", ".", "..", "../escape", "a/b", "/etc/passwd", "a\\b"] {
            assert!(
                validate_storage_file_name(name).is_err(),
                "expected '{name}' to be rejected"
            );
        }
    }

    #[test]
    fn regression_validate_storage_file_name_protects_database_files() {
        for name in ["ext.db", "ext.db-journal", "ext.db-wal", "ext.db-shm"] {
            let error = validate_storage_file_name(name).expect_err(name);
            assert!(error.contains("reserved for the extension database"), "{error}");
        }
        assert!(validate_storage_file_name("ext.db.json").is_ok());
    }
}
