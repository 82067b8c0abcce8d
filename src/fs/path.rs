use crate::fs::error::{FsError, FsResult};

const MAX_PATH_LENGTH: usize = 4096;
const MAX_FILENAME_LENGTH: usize = 255;

/// Canonical form of an absolute slash-separated path.
///
/// Empty components and `.` are dropped, `..` pops its parent (and stops at
/// the root), and the result never ends with `/` unless it is the root.
pub fn normalize_path(path: &str) -> FsResult<String> {
    if path.is_empty() {
        return Err(FsError::InvalidItem("Empty path".to_string()));
    }

    if path.contains('\0') {
        return Err(FsError::InvalidItem("Path contains NULL character".to_string()));
    }

    if path.len() > MAX_PATH_LENGTH {
        return Err(FsError::InvalidItem(format!(
            "Path too long: {} bytes (max {MAX_PATH_LENGTH})",
            path.len()
        )));
    }

    if !path.starts_with('/') {
        return Err(FsError::InvalidItem(format!("Path must start with /: {path}")));
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => {
                if name.len() > MAX_FILENAME_LENGTH {
                    return Err(FsError::InvalidItem(format!(
                        "Filename too long: {} bytes (max {MAX_FILENAME_LENGTH})",
                        name.len()
                    )));
                }
                parts.push(name);
            }
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// Join a single child name onto an already normalized parent.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" { format!("/{name}") } else { format!("{parent}/{name}") }
}
