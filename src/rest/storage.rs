// src/rest/storage.rs - Storage-root fallback and remote name resolution
use std::future::Future;

use crate::error::AdapterError;
use crate::types::{basename, RemoteFile};

/// Statuses that let an operation move on to the next storage root.
pub fn is_fallback_status(status: u16) -> bool {
    matches!(status, 403 | 404)
}

/// Runs `op` against each root in preference order.
///
/// Moves to the next root only when the current one fails with a
/// fallback-eligible status. Any other failure stops immediately. Errors
/// carry every attempted root and the final cause. Returns the root that
/// succeeded along with the operation's value.
pub async fn with_storage_fallback<T, F, Fut>(
    roots: &[&str],
    operation: &str,
    mut op: F,
) -> Result<(String, T), AdapterError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut attempted: Vec<String> = Vec::with_capacity(roots.len());
    let mut last_error: Option<AdapterError> = None;

    for root in roots {
        match op(root.to_string()).await {
            Ok(value) => {
                if !attempted.is_empty() {
                    tracing::info!("{} succeeded on storage '{}' after trying {}", operation, root, attempted.join(", "));
                }
                return Ok((root.to_string(), value));
            }
            Err(err) => {
                let fallback = err.status().map(is_fallback_status).unwrap_or(false);
                attempted.push(format!("{} ({})", root, err.status().map(|s| s.to_string()).unwrap_or_else(|| err.kind().to_string())));
                if !fallback {
                    return Err(aggregate(operation, &attempted, err));
                }
                tracing::debug!("{} on storage '{}' failed with a fallback status, trying next root", operation, root);
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) => Err(aggregate(operation, &attempted, err)),
        None => Err(AdapterError::validation(format!("{}: no storage roots configured", operation))),
    }
}

fn aggregate(operation: &str, attempted: &[String], err: AdapterError) -> AdapterError {
    err.context(format!("{} failed on storage roots [{}]", operation, attempted.join(", ")))
}

/// Maps a caller-supplied identifier to the path the firmware expects.
///
/// Tries, in order: exact path, exact display name, unique basename. Several
/// basename matches are an error listing the candidates; no match returns the
/// input unchanged.
pub fn resolve_remote_path(files: &[RemoteFile], input: &str) -> Result<String, AdapterError> {
    let wanted = input.trim();

    if let Some(file) = files.iter().find(|f| f.path == wanted) {
        return Ok(file.path.clone());
    }
    if let Some(file) = files.iter().find(|f| f.name == wanted) {
        return Ok(file.path.clone());
    }

    let wanted_base = basename(wanted);
    let mut candidates: Vec<&RemoteFile> = files
        .iter()
        .filter(|f| f.basename() == wanted_base || basename(&f.name) == wanted_base)
        .collect();
    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates.dedup_by(|a, b| a.path == b.path);

    match candidates.as_slice() {
        [] => Ok(input.to_string()),
        [single] => Ok(single.path.clone()),
        many => {
            let listed: Vec<&str> = many.iter().map(|f| f.path.as_str()).collect();
            Err(AdapterError::validation(format!(
                "'{}' matches several remote files: {}. Pass the full path",
                input,
                listed.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn file(name: &str, path: &str) -> RemoteFile {
        RemoteFile {
            name: name.to_string(),
            path: path.to_string(),
            size: None,
            modified: None,
        }
    }

    #[test]
    fn resolves_path_then_name_then_basename() {
        let files = vec![
            file("calibration_cube_0.2mm_PLA.bgcode", "/usb/CALIBR~1.BGC"),
            file("benchy.bgcode", "/local/benchy.bgcode"),
        ];
        assert_eq!(resolve_remote_path(&files, "/usb/CALIBR~1.BGC").unwrap(), "/usb/CALIBR~1.BGC");
        assert_eq!(
            resolve_remote_path(&files, "calibration_cube_0.2mm_PLA.bgcode").unwrap(),
            "/usb/CALIBR~1.BGC"
        );
        assert_eq!(resolve_remote_path(&files, "prints/benchy.bgcode").unwrap(), "/local/benchy.bgcode");
    }

    #[test]
    fn unmatched_input_passes_through() {
        let files = vec![file("a.gcode", "/usb/a.gcode")];
        assert_eq!(resolve_remote_path(&files, "missing.gcode").unwrap(), "missing.gcode");
    }

    #[test]
    fn ambiguous_basename_lists_candidates() {
        let files = vec![file("part.gcode", "/usb/part.gcode"), file("part.gcode", "/local/part.gcode")];
        let err = resolve_remote_path(&files, "x/part.gcode").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("/usb/part.gcode"));
        assert!(err.to_string().contains("/local/part.gcode"));
    }

    #[test]
    fn repeated_listing_of_one_file_is_not_ambiguous() {
        let files = vec![
            file("part.gcode", "/usb/part.gcode"),
            file("PART.GCO", "/usb/other/part.gcode"),
            file("part.gcode", "/usb/part.gcode"),
        ];
        let err = resolve_remote_path(&files, "x/part.gcode").unwrap_err();
        let message = err.to_string();
        assert_eq!(message.matches("/usb/part.gcode").count(), 1);
        assert!(message.contains("/usb/other/part.gcode"));

        let single = vec![
            file("part.gcode", "/usb/part.gcode"),
            file("cube.gcode", "/usb/cube.gcode"),
            file("part.gcode", "/usb/part.gcode"),
        ];
        assert_eq!(resolve_remote_path(&single, "x/part.gcode").unwrap(), "/usb/part.gcode");
    }

    #[tokio::test]
    async fn non_fallback_error_stops_at_first_root() {
        let mut calls = Vec::new();
        let result: Result<(String, ()), AdapterError> = with_storage_fallback(&["usb", "local"], "upload", |root| {
            calls.push(root.clone());
            async move { Err(AdapterError::protocol("boom").with_status(500)) }
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(calls, vec!["usb".to_string()]);
        assert!(err.to_string().contains("usb (500)"));
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn all_roots_exhausted_lists_each() {
        let result: Result<(String, ()), AdapterError> = with_storage_fallback(&["usb", "local"], "delete", |_| async {
            Err(AdapterError::new(ErrorKind::NotFound, "missing").with_status(404))
        })
        .await;
        let message = result.unwrap_err().to_string();
        assert!(message.contains("usb (404)"));
        assert!(message.contains("local (404)"));
    }
}
