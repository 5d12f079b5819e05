//! Locating stored reports from request identifiers.

use std::path::{Component, Path, PathBuf};

use crate::{BridgeError, BridgeResult, Config};

/// Request prefix for direct filesystem lookups (single-user mode only).
pub const FILE_ROUTE_PREFIX: &str = "/json/file/";

/// Prepends `storage_dir` to a bare `filename`.
pub fn storage_name(storage_dir: &Path, filename: &str) -> BridgeResult<PathBuf> {
    if filename.is_empty() {
        return Err(BridgeError::InvalidInput(
            "filename must have length greater than 0".to_string(),
        ));
    }
    let mut components = Path::new(filename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(storage_dir.join(filename)),
        _ => Err(BridgeError::InvalidInput(format!(
            "{filename:?} is not a bare file name"
        ))),
    }
}

/// Maps a stats request to the report file it names.
///
/// `prof_name` is the identifier captured from `request_path`. Requests
/// under [`FILE_ROUTE_PREFIX`] name an absolute path and are only honoured
/// in single-user mode; everything else is a stored report name.
pub fn resolve_report_path(
    config: &Config,
    request_path: &str,
    prof_name: &str,
) -> BridgeResult<PathBuf> {
    if request_path.starts_with(FILE_ROUTE_PREFIX) {
        if !config.single_user_mode {
            return Err(BridgeError::NotFound(format!(
                "{request_path}: file lookups require single-user mode"
            )));
        }
        let absolute = if prof_name.starts_with('/') {
            PathBuf::from(prof_name)
        } else {
            PathBuf::from(format!("/{prof_name}"))
        };
        return Ok(normalize(&absolute));
    }
    storage_name(&config.storage_dir(), prof_name)
}

/// Lexically resolves `.` and `..` in an absolute path.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
