use std::path::Path;

use serde_json::Value;
use tracing::debug;

/// Load a connector checkpoint. A missing file means "start from scratch";
/// an unreadable file is an error the connector should surface.
pub fn load_checkpoint(path: &Path) -> std::io::Result<Option<Value>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let value = serde_json::from_str(&raw)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Persist a checkpoint atomically: write `path.tmp`, then rename over
/// `path`. A crash mid-write never corrupts the previous checkpoint.
pub fn save_checkpoint(path: &Path, cursor: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(cursor)?)?;
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "checkpoint saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");

        assert!(load_checkpoint(&path).unwrap().is_none());

        save_checkpoint(&path, &json!({"last_update_id": 882})).unwrap();
        let loaded = load_checkpoint(&path).unwrap().unwrap();
        assert_eq!(loaded["last_update_id"], 882);

        // Overwrite goes through the same tmp+rename path.
        save_checkpoint(&path, &json!({"last_update_id": 883})).unwrap();
        assert_eq!(load_checkpoint(&path).unwrap().unwrap()["last_update_id"], 883);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_checkpoint(&path).is_err());
    }
}
