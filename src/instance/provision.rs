//! Creating and importing instances under the servers directory.

use super::{
    BackupSchedule, InstanceConfig, ServerInstance, BACKUPS_DIR, CONFIG_FILE, DEFAULT_PORT, EULA_FILE,
    PLUGINS_DIR, PROPERTIES_FILE,
};
use crate::supervisor::SupervisorError;
use anyhow::Context;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

/// Memory written into the config of imported servers.
const IMPORT_MEMORY_MB: u64 = 2048;

/// Parameters for a fresh instance. The jar must already be on disk.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub description: String,
    pub server_type: String,
    pub version: String,
    pub jar: PathBuf,
    pub memory_mb: u64,
    pub port: u16,
    pub max_players: u32,
    pub backup: BackupSchedule,
}

impl NewServer {
    pub fn new(name: &str, server_type: &str, version: &str, jar: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            description: "A Minecraft Server".to_string(),
            server_type: server_type.to_string(),
            version: version.to_string(),
            jar: jar.into(),
            memory_mb: super::DEFAULT_MEMORY_MB,
            port: DEFAULT_PORT,
            max_players: 20,
            backup: BackupSchedule::default(),
        }
    }
}

/// Keep `[A-Za-z0-9_-]`, replace everything else with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// `name`, or `name_1`, `name_2`, ... whichever does not exist yet.
fn unique_dir(servers_dir: &Path, folder: &str) -> (String, PathBuf) {
    let first = servers_dir.join(folder);
    if !first.exists() {
        return (folder.to_string(), first);
    }
    let mut counter = 1;
    loop {
        let candidate = format!("{}_{}", folder, counter);
        let path = servers_dir.join(&candidate);
        if !path.exists() {
            return (candidate, path);
        }
        counter += 1;
    }
}

fn prepare_dir(servers_dir: &Path, name: &str) -> Result<(String, PathBuf), SupervisorError> {
    let folder = sanitize_name(name);
    if folder.is_empty() || folder.chars().all(|c| c == '_') {
        return Err(SupervisorError::InvalidName(name.to_string()));
    }
    fs::create_dir_all(servers_dir)
        .with_context(|| format!("Failed to create servers directory {}", servers_dir.display()))?;
    let (folder, dir) = unique_dir(servers_dir, &folder);
    fs::create_dir(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok((folder, dir))
}

/// Default `server.properties` for a new server.
pub fn default_properties(new: &NewServer) -> String {
    let entries: [(&str, String); 18] = [
        ("server-port", new.port.to_string()),
        ("motd", new.description.clone()),
        ("max-players", new.max_players.to_string()),
        ("view-distance", "10".to_string()),
        ("gamemode", "survival".to_string()),
        ("difficulty", "easy".to_string()),
        ("online-mode", "true".to_string()),
        ("pvp", "true".to_string()),
        ("white-list", "false".to_string()),
        ("enforce-whitelist", "false".to_string()),
        ("enable-command-block", "false".to_string()),
        ("spawn-protection", "0".to_string()),
        ("allow-nether", "true".to_string()),
        ("spawn-monsters", "true".to_string()),
        ("spawn-animals", "true".to_string()),
        ("spawn-npcs", "true".to_string()),
        ("hardcore", "false".to_string()),
        ("level-name", "world".to_string()),
    ];
    let mut out = String::from("# Generated by mcman\n");
    for (key, value) in entries {
        out.push_str(key);
        out.push('=');
        out.push_str(&value);
        out.push('\n');
    }
    out
}

/// Create `<servers_dir>/<sanitized name>` with the jar, properties, eula and config.
pub fn create_instance(servers_dir: &Path, new: &NewServer) -> Result<ServerInstance, SupervisorError> {
    if !new.jar.is_file() {
        return Err(SupervisorError::NoJarFound(new.jar.display().to_string()));
    }
    let (folder, dir) = prepare_dir(servers_dir, &new.name)?;

    let result = populate_new(&dir, new);
    if let Err(e) = result {
        // 반쯤 만들어진 디렉토리는 남기지 않음
        let _ = fs::remove_dir_all(&dir);
        return Err(e);
    }

    tracing::info!("Server '{}' created in {}", new.name, dir.display());
    Ok(ServerInstance::new(folder, dir))
}

fn populate_new(dir: &Path, new: &NewServer) -> Result<(), SupervisorError> {
    let jar_name = format!("{}-{}.jar", new.server_type, new.version);
    fs::copy(&new.jar, dir.join(&jar_name))
        .with_context(|| format!("Failed to copy {} into {}", new.jar.display(), dir.display()))?;

    let props = dir.join(PROPERTIES_FILE);
    fs::write(&props, default_properties(new)).map_err(|e| SupervisorError::config_write(&props, e))?;

    let eula = dir.join(EULA_FILE);
    fs::write(&eula, "# Generated by mcman\neula=true\n").map_err(|e| SupervisorError::config_write(&eula, e))?;

    let config = InstanceConfig {
        name: Some(new.name.clone()),
        description: Some(new.description.clone()),
        server_id: Some(uuid::Uuid::new_v4().to_string()),
        port: Some(new.port),
        server_type: Some(new.server_type.clone()),
        version: Some(new.version.clone()),
        memory: Some(new.memory_mb),
        backup: Some(new.backup.clone()),
        ..Default::default()
    };
    write_config(dir, &config)?;

    for sub in [BACKUPS_DIR, PLUGINS_DIR] {
        fs::create_dir_all(dir.join(sub)).with_context(|| format!("Failed to create {}", sub))?;
    }
    Ok(())
}

fn write_config(dir: &Path, config: &InstanceConfig) -> Result<(), SupervisorError> {
    let path = dir.join(CONFIG_FILE);
    let json = serde_json::to_string_pretty(config).map_err(|e| SupervisorError::config_write(&path, e))?;
    crate::utils::write_atomic(&path, json.as_bytes()).map_err(|e| SupervisorError::config_write(&path, e))
}

/// Server type and version guessed from a jar file name.
pub fn detect_jar_metadata(file_name: &str) -> (String, String) {
    let lower = file_name.to_lowercase();
    let server_type = ["paper", "purpur", "spigot"]
        .into_iter()
        .find(|t| lower.contains(t))
        .unwrap_or("unknown");
    let version = Regex::new(r"(\d+\.\d+\.\d+)")
        .ok()
        .and_then(|re| re.captures(file_name).map(|c| c[1].to_string()))
        .unwrap_or_else(|| "unknown".to_string());
    (server_type.to_string(), version)
}

/// Copy an existing server directory in under `name`.
pub fn import_instance(servers_dir: &Path, source: &Path, name: &str) -> Result<ServerInstance, SupervisorError> {
    let source_instance = ServerInstance::new(name, source);
    let Some(jar) = source_instance.find_jar() else {
        return Err(SupervisorError::NoJarFound(source.display().to_string()));
    };
    let (folder, dir) = prepare_dir(servers_dir, name)?;

    if let Err(e) = populate_import(source, &dir, name, &jar) {
        let _ = fs::remove_dir_all(&dir);
        return Err(e);
    }

    tracing::info!("Server imported from {} as '{}'", source.display(), folder);
    Ok(ServerInstance::new(folder, dir))
}

fn populate_import(source: &Path, dir: &Path, name: &str, jar: &Path) -> Result<(), SupervisorError> {
    copy_dir_recursive(source, dir)
        .with_context(|| format!("Failed to copy {} to {}", source.display(), dir.display()))?;
    fs::create_dir_all(dir.join(BACKUPS_DIR)).context("Failed to create backups directory")?;

    if !dir.join(CONFIG_FILE).exists() {
        let file_name = jar.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let (server_type, version) = detect_jar_metadata(file_name);
        let config = InstanceConfig {
            name: Some(name.to_string()),
            description: Some("Imported Server".to_string()),
            server_type: Some(server_type),
            version: Some(version),
            memory: Some(IMPORT_MEMORY_MB),
            backup: Some(BackupSchedule {
                enabled: true,
                frequency: 24.0,
                max_backups: 10,
            }),
            ..Default::default()
        };
        write_config(dir, &config)?;
    }
    Ok(())
}

/// 디렉토리 트리 재귀 복사 (심볼릭 링크는 따라가지 않음)
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My Server!"), "My_Server_");
        assert_eq!(sanitize_name("survival-2_b"), "survival-2_b");
        assert_eq!(sanitize_name("../x"), "___x");
    }

    #[test]
    fn test_detect_jar_metadata() {
        assert_eq!(detect_jar_metadata("paper-1.20.4-496.jar"), ("paper".into(), "1.20.4".into()));
        assert_eq!(detect_jar_metadata("Purpur.jar"), ("purpur".into(), "unknown".into()));
        assert_eq!(detect_jar_metadata("server.jar"), ("unknown".into(), "unknown".into()));
    }

    #[test]
    fn test_create_instance_layout() {
        let root = tempfile::tempdir().unwrap();
        let jar = root.path().join("download.jar");
        fs::write(&jar, b"PK fake jar").unwrap();
        let servers = root.path().join("servers");

        let mut new = NewServer::new("My Server", "purpur", "1.20.4", &jar);
        new.port = 25570;
        new.memory_mb = 2048;
        let inst = create_instance(&servers, &new).unwrap();

        assert_eq!(inst.name(), "My_Server");
        let dir = inst.base_dir();
        assert!(dir.join("purpur-1.20.4.jar").is_file());
        assert!(dir.join(BACKUPS_DIR).is_dir());
        assert!(dir.join(PLUGINS_DIR).is_dir());
        assert!(fs::read_to_string(dir.join(EULA_FILE)).unwrap().contains("eula=true"));
        assert_eq!(inst.port(), 25570);
        assert_eq!(inst.max_ram_mb(), 2048);
        let config = inst.load_config();
        assert_eq!(config.server_type.as_deref(), Some("purpur"));
        assert!(config.server_id.is_some());

        // second create with the same name gets a suffixed directory
        let second = create_instance(&servers, &new).unwrap();
        assert_eq!(second.name(), "My_Server_1");
    }

    #[test]
    fn test_create_without_jar() {
        let root = tempfile::tempdir().unwrap();
        let new = NewServer::new("x", "paper", "1.20.4", root.path().join("missing.jar"));
        assert!(matches!(
            create_instance(root.path(), &new),
            Err(SupervisorError::NoJarFound(_))
        ));
        assert!(!root.path().join("x").exists());
    }

    #[test]
    fn test_create_rejects_empty_name() {
        let root = tempfile::tempdir().unwrap();
        let jar = root.path().join("a.jar");
        fs::write(&jar, b"").unwrap();
        let new = NewServer::new("   ", "paper", "1.20.4", &jar);
        assert!(matches!(
            create_instance(&root.path().join("servers"), &new),
            Err(SupervisorError::InvalidName(_))
        ));
    }

    #[test]
    fn test_import_instance() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("old");
        fs::create_dir_all(source.join("world/region")).unwrap();
        fs::write(source.join("paper-1.19.2.jar"), b"jar").unwrap();
        fs::write(source.join("world/region/r.0.0.mca"), b"region").unwrap();

        let servers = root.path().join("servers");
        let inst = import_instance(&servers, &source, "old world").unwrap();
        assert_eq!(inst.name(), "old_world");
        assert_eq!(
            fs::read(inst.base_dir().join("world/region/r.0.0.mca")).unwrap(),
            b"region"
        );
        assert!(inst.backups_dir().is_dir());
        let config = inst.load_config();
        assert_eq!(config.server_type.as_deref(), Some("paper"));
        assert_eq!(config.version.as_deref(), Some("1.19.2"));
        assert_eq!(config.memory, Some(2048));
        assert!(config.backup_schedule().enabled);
    }

    #[test]
    fn test_import_keeps_existing_config() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("src");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("server.jar"), b"jar").unwrap();
        fs::write(source.join(CONFIG_FILE), r#"{"memory": 6144, "custom": 1}"#).unwrap();

        let inst = import_instance(&root.path().join("servers"), &source, "kept").unwrap();
        let config = inst.load_config();
        assert_eq!(config.memory, Some(6144));
        assert_eq!(config.extra["custom"], 1);
    }

    #[test]
    fn test_import_requires_jar() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            import_instance(&root.path().join("servers"), root.path(), "nojar"),
            Err(SupervisorError::NoJarFound(_))
        ));
    }
}
