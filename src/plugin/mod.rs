//! Bukkit-style plugin jars under `<instance>/plugins/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::supervisor::SupervisorError;

/// Shown until the server logs the real version.
pub const UNKNOWN_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub path: PathBuf,
    pub version: String,
}

/// `[Server thread/INFO]: [Essentials] Loading Essentials v2.20.1` style lines
/// are matched as `Loading <name> (<version>)` or `Loading <name> v<version>`.
fn loading_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Loading (\S+?)(?: \(([^)]+)\)| v(\S+))\s*$").expect("static plugin loading pattern")
    })
}

/// Version reported for `plugin` in console output, latest line wins.
pub fn version_from_console(plugin: &str, console: &[String]) -> Option<String> {
    let re = loading_line();
    console.iter().rev().find_map(|line| {
        let caps = re.captures(line.trim_end())?;
        if !caps.get(1)?.as_str().eq_ignore_ascii_case(plugin) {
            return None;
        }
        caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str().to_string())
    })
}

pub struct PluginManager {
    dir: PathBuf,
}

impl PluginManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Jars in the plugins folder, sorted by name. `console` may be empty.
    pub fn list(&self, console: &[String]) -> Result<Vec<PluginInfo>, SupervisorError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SupervisorError::Internal(e.into())),
        };
        let mut plugins: Vec<PluginInfo> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().map(|x| x.eq_ignore_ascii_case("jar")).unwrap_or(false))
            .filter_map(|path| {
                let name = path.file_stem()?.to_string_lossy().to_string();
                let version = version_from_console(&name, console).unwrap_or_else(|| UNKNOWN_VERSION.to_string());
                Some(PluginInfo { name, path, version })
            })
            .collect();
        plugins.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(plugins)
    }

    /// Copy a jar into the plugins folder, replacing one with the same file name.
    pub fn install(&self, jar: &Path) -> Result<PluginInfo, SupervisorError> {
        let is_jar = jar.extension().map(|x| x.eq_ignore_ascii_case("jar")).unwrap_or(false);
        let file_name = jar
            .file_name()
            .filter(|_| is_jar)
            .ok_or_else(|| SupervisorError::InvalidName(jar.display().to_string()))?;
        if !jar.is_file() {
            return Err(SupervisorError::Internal(anyhow::anyhow!(
                "plugin file '{}' does not exist",
                jar.display()
            )));
        }
        fs::create_dir_all(&self.dir).map_err(|e| SupervisorError::Internal(e.into()))?;
        let dest = self.dir.join(file_name);
        fs::copy(jar, &dest).map_err(|e| SupervisorError::Internal(e.into()))?;
        tracing::info!("Installed plugin {}", dest.display());

        Ok(PluginInfo {
            name: Path::new(file_name).file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default(),
            path: dest,
            version: UNKNOWN_VERSION.to_string(),
        })
    }

    /// Remove `<name>.jar`; the name may be given with or without the extension.
    pub fn delete(&self, name: &str) -> Result<(), SupervisorError> {
        crate::instance::validate_name(name)?;
        let file_name = if name.to_lowercase().ends_with(".jar") {
            name.to_string()
        } else {
            format!("{}.jar", name)
        };
        let path = self.dir.join(&file_name);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("Deleted plugin {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SupervisorError::Internal(anyhow::anyhow!(
                "plugin '{}' not found",
                name
            ))),
            Err(e) => Err(SupervisorError::Internal(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_from_console() {
        let console = vec![
            "[12:00:00] [Server thread/INFO]: [WorldEdit] Loading WorldEdit (7.2.15+6463-5ca4dff)".to_string(),
            "[12:00:01] [Server thread/INFO]: [Essentials] Loading Essentials v2.20.1".to_string(),
            "[12:00:02] [Server thread/INFO]: Done (3.2s)!".to_string(),
        ];
        assert_eq!(
            version_from_console("WorldEdit", &console).as_deref(),
            Some("7.2.15+6463-5ca4dff")
        );
        assert_eq!(version_from_console("essentials", &console).as_deref(), Some("2.20.1"));
        assert_eq!(version_from_console("Vault", &console), None);
    }

    #[test]
    fn test_list_install_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = PluginManager::new(dir.path().join("plugins"));
        assert!(mgr.list(&[]).unwrap().is_empty());

        let src = dir.path().join("Vault.jar");
        fs::write(&src, b"PK").unwrap();
        let info = mgr.install(&src).unwrap();
        assert_eq!(info.name, "Vault");
        assert_eq!(info.version, UNKNOWN_VERSION);
        fs::write(mgr.dir().join("notes.txt"), b"ignored").unwrap();

        let console = vec!["[Vault] Loading Vault (1.7.3-b131)".to_string()];
        let listed = mgr.list(&console).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].version, "1.7.3-b131");

        assert!(mgr.install(&dir.path().join("missing.jar")).is_err());
        assert!(matches!(
            mgr.install(&dir.path().join("Vault.zip")),
            Err(SupervisorError::InvalidName(_))
        ));

        mgr.delete("Vault").unwrap();
        assert!(mgr.delete("Vault.jar").is_err());
        assert!(matches!(mgr.delete("../x"), Err(SupervisorError::InvalidName(_))));
        assert!(mgr.list(&[]).unwrap().is_empty());
    }
}
