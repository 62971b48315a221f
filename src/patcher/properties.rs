use super::{read_or_empty, write_if_changed, PatchError};
use std::path::{Path, PathBuf};

/// How keys missing from the file are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchMode {
    /// Replace existing keys, append the rest
    Upsert,
    /// Only rewrite keys that already exist
    ExistingOnly,
}

/// Handle on a `key=value` file such as `server.properties`.
#[derive(Debug, Clone)]
pub struct PropertiesFile {
    path: PathBuf,
}

impl PropertiesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// All entries in file order. Missing file → empty.
    pub fn read(&self) -> Result<Vec<(String, String)>, PatchError> {
        Ok(parse(&read_or_empty(&self.path)?))
    }

    /// Value of `key`, `None` when the file or the key is absent.
    pub fn get(&self, key: &str) -> Option<String> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        parse(&text)
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Apply `patch` and write the file back. Returns whether the file changed.
    pub fn patch<K, V>(&self, patch: &[(K, V)], mode: PatchMode) -> Result<bool, PatchError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let old = read_or_empty(&self.path)?;
        let new = patch_text(&old, patch, mode);
        if mode == PatchMode::ExistingOnly && !self.exists() {
            return Ok(false);
        }
        let changed = write_if_changed(&self.path, &old, &new)?;
        if changed {
            tracing::debug!("Patched {} ({} keys)", self.path.display(), patch.len());
        }
        Ok(changed)
    }
}

fn split_entry(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
        return None;
    }
    let (key, value) = trimmed.split_once('=')?;
    Some((key.trim(), value.trim()))
}

/// Parse `key=value` lines; comments and blank lines are skipped.
pub fn parse(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(split_entry)
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Patch `text` in place: matching keys are rewritten where they stand, comments
/// and unknown keys are preserved, and (in `Upsert` mode) new keys are appended
/// in patch order. Output always uses `\n` line endings with a trailing newline.
pub fn patch_text<K, V>(text: &str, patch: &[(K, V)], mode: PatchMode) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut applied = vec![false; patch.len()];
    let mut out: Vec<String> = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        let replacement = split_entry(line).and_then(|(key, _)| {
            patch
                .iter()
                .position(|(k, _)| k.as_ref() == key)
                .map(|idx| (idx, key))
        });
        match replacement {
            Some((idx, key)) => {
                applied[idx] = true;
                out.push(format!("{}={}", key, patch[idx].1.as_ref()));
            }
            None => out.push(line.to_string()),
        }
    }

    if mode == PatchMode::Upsert {
        for (idx, (key, value)) in patch.iter().enumerate() {
            // 같은 키가 패치에 두 번 들어있으면 첫 번째만 추가
            let first = patch.iter().position(|(k, _)| k.as_ref() == key.as_ref()) == Some(idx);
            if !applied[idx] && first {
                out.push(format!("{}={}", key.as_ref(), value.as_ref()));
            }
        }
    }

    let mut result = out.join("\n");
    if !result.is_empty() {
        result.push('\n');
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "#Minecraft server properties\n#Mon Jan 01 00:00:00 UTC 2024\nserver-port=25565\nmotd=A Minecraft Server\nmax-players=20\n";

    #[test]
    fn test_parse_skips_comments() {
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], ("server-port".to_string(), "25565".to_string()));
    }

    #[test]
    fn test_value_may_contain_equals() {
        let entries = parse("motd=a=b\n");
        assert_eq!(entries[0].1, "a=b");
    }

    #[test]
    fn test_patch_replaces_in_place_and_appends() {
        let out = patch_text(SAMPLE, &[("max-players", "50"), ("pvp", "false")], PatchMode::Upsert);
        assert_eq!(
            out,
            "#Minecraft server properties\n#Mon Jan 01 00:00:00 UTC 2024\nserver-port=25565\nmotd=A Minecraft Server\nmax-players=50\npvp=false\n"
        );
    }

    #[test]
    fn test_patch_existing_only() {
        let out = patch_text(SAMPLE, &[("simulation-distance", "8"), ("server-port", "25570")], PatchMode::ExistingOnly);
        assert!(out.contains("server-port=25570"));
        assert!(!out.contains("simulation-distance"));
    }

    #[test]
    fn test_patch_is_idempotent() {
        let patch = [("server-port", "25566"), ("view-distance", "8")];
        let once = patch_text("a=1\r\nserver-port=25565", &patch, PatchMode::Upsert);
        let twice = patch_text(&once, &patch, PatchMode::Upsert);
        assert_eq!(once, twice);
        assert!(!once.contains('\r'));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = PropertiesFile::new(dir.path().join("server.properties"));
        assert_eq!(file.get("server-port"), None);

        assert!(file.patch(&[("server-port", "25566")], PatchMode::Upsert).unwrap());
        assert_eq!(file.get("server-port").as_deref(), Some("25566"));
        // second identical patch does not touch the file
        assert!(!file.patch(&[("server-port", "25566")], PatchMode::Upsert).unwrap());
    }

    #[test]
    fn test_existing_only_does_not_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = PropertiesFile::new(dir.path().join("server.properties"));
        assert!(!file.patch(&[("a", "b")], PatchMode::ExistingOnly).unwrap());
        assert!(!file.exists());
    }
}
