use super::{read_or_empty, write_if_changed, PatchError};
use serde_yaml::{Mapping, Value};
use std::path::Path;

/// Recursively merge `patch` into `base`. Mappings merge key by key; any other
/// value (scalars, sequences) replaces what was there.
pub fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Mapping(base_map), Value::Mapping(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Build `{a: {b: {c: value}}}` from `["a", "b", "c"]`.
pub fn nested(path: &[&str], value: Value) -> Value {
    path.iter().rev().fold(value, |inner, key| {
        let mut map = Mapping::new();
        map.insert(Value::String((*key).to_string()), inner);
        Value::Mapping(map)
    })
}

fn parse_document(path: &Path, text: &str) -> Result<Value, PatchError> {
    if text.trim().is_empty() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    let doc: Value = serde_yaml::from_str(text).map_err(|e| PatchError::Yaml {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(match doc {
        Value::Null => Value::Mapping(Mapping::new()),
        other => other,
    })
}

/// Merge `patch` into the YAML file at `path` (created if missing).
/// Returns whether the file changed.
pub fn patch_file(path: &Path, patch: Value) -> Result<bool, PatchError> {
    let old = read_or_empty(path)?;
    let mut doc = parse_document(path, &old)?;
    deep_merge(&mut doc, patch);
    let new = serde_yaml::to_string(&doc).map_err(|e| PatchError::Yaml {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let changed = write_if_changed(path, &old, &new)?;
    if changed {
        tracing::debug!("Patched {}", path.display());
    }
    Ok(changed)
}

/// Look up a nested value, e.g. `["world-settings", "default", "merge-radius"]`.
pub fn get_path<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(doc, |node, key| node.get(*key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_merge_keeps_siblings() {
        let mut base: Value = serde_yaml::from_str("chunk-gc:\n  period-in-ticks: 600\n  other: 1\nsettings:\n  allow-end: true\n").unwrap();
        deep_merge(&mut base, nested(&["chunk-gc", "period-in-ticks"], Value::from(400)));
        assert_eq!(get_path(&base, &["chunk-gc", "period-in-ticks"]), Some(&Value::from(400)));
        assert_eq!(get_path(&base, &["chunk-gc", "other"]), Some(&Value::from(1)));
        assert_eq!(get_path(&base, &["settings", "allow-end"]), Some(&Value::from(true)));
    }

    #[test]
    fn test_scalar_replaced_by_mapping() {
        let mut base: Value = serde_yaml::from_str("a: 1\n").unwrap();
        deep_merge(&mut base, nested(&["a", "b"], Value::from("x")));
        assert_eq!(get_path(&base, &["a", "b"]), Some(&Value::from("x")));
    }

    #[test]
    fn test_patch_file_creates_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bukkit.yml");
        let patch = || nested(&["spawn-limits", "monsters"], Value::from(50));

        assert!(patch_file(&path, patch()).unwrap());
        let once = std::fs::read(&path).unwrap();
        assert!(!patch_file(&path, patch()).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), once);
    }

    #[test]
    fn test_invalid_yaml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spigot.yml");
        std::fs::write(&path, "a: [unclosed\n").unwrap();
        let err = patch_file(&path, nested(&["a"], Value::from(1))).unwrap_err();
        assert!(matches!(err, PatchError::Yaml { .. }));
        // untouched on failure
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a: [unclosed\n");
    }
}
