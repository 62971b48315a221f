pub mod provision;

pub use provision::{create_instance, import_instance, NewServer};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::patcher::{self, OptimizationSettings, PatchMode, PropertiesFile};
use crate::supervisor::SupervisorError;

pub const DEFAULT_MEMORY_MB: u64 = 4096;
pub const DEFAULT_PORT: u16 = 25565;
pub const DEFAULT_HOST: &str = "127.0.0.1";

pub const CONFIG_FILE: &str = "server_config.json";
pub const PROPERTIES_FILE: &str = "server.properties";
pub const EULA_FILE: &str = "eula.txt";
pub const BACKUPS_DIR: &str = "backups";
pub const PLUGINS_DIR: &str = "plugins";

// ─── server_config.json ──────────────────────────────────────

/// Automatic backup settings (`backup` key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSchedule {
    #[serde(default)]
    pub enabled: bool,
    /// Hours between backups
    #[serde(default = "default_frequency", deserialize_with = "lenient::number_f64")]
    pub frequency: f64,
    /// Negative keeps every backup
    #[serde(default = "default_max_backups", deserialize_with = "lenient::number_i64")]
    pub max_backups: i64,
}

fn default_frequency() -> f64 {
    24.0
}

fn default_max_backups() -> i64 {
    10
}

impl Default for BackupSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: default_frequency(),
            max_backups: default_max_backups(),
        }
    }
}

/// 인스턴스별 설정 파일. 모르는 키는 `extra`에 보존되어 그대로 다시 기록됨
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::opt_u16")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::opt_u64")]
    pub memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizations: Option<OptimizationSettings>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InstanceConfig {
    /// Heap size: `memory`, then the older `advanced.memory`, then the default.
    pub fn memory_mb(&self) -> u64 {
        self.memory
            .or_else(|| {
                self.extra
                    .get("advanced")
                    .and_then(|adv| adv.get("memory"))
                    .and_then(lenient::value_as_u64)
            })
            .filter(|mb| *mb > 0)
            .unwrap_or(DEFAULT_MEMORY_MB)
    }

    pub fn backup_schedule(&self) -> BackupSchedule {
        self.backup.clone().unwrap_or_default()
    }
}

/// Numbers that may have been written as strings (`"memory": "2048"`).
mod lenient {
    use super::*;

    pub fn value_as_u64(value: &Value) -> Option<u64> {
        match value {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64),
            _ => None,
        }
    }

    fn value_as_f64(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn invalid<E: serde::de::Error>(value: &Value, what: &str) -> E {
        E::custom(format!("expected {}, got {}", what, value))
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        let value = Value::deserialize(d)?;
        if value.is_null() {
            return Ok(None);
        }
        value_as_u64(&value).map(Some).ok_or_else(|| invalid(&value, "a number"))
    }

    pub fn opt_u16<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u16>, D::Error> {
        let value = Value::deserialize(d)?;
        if value.is_null() {
            return Ok(None);
        }
        value_as_u64(&value)
            .and_then(|n| u16::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| invalid(&value, "a port number"))
    }

    pub fn number_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        let value = Value::deserialize(d)?;
        value_as_f64(&value).ok_or_else(|| invalid(&value, "a number"))
    }

    pub fn number_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let value = Value::deserialize(d)?;
        value_as_f64(&value).map(|f| f as i64).ok_or_else(|| invalid(&value, "an integer"))
    }
}

// ─── Instance ────────────────────────────────────────────────

/// 관리 대상 Minecraft 서버 한 개 (디렉토리 단위)
#[derive(Debug, Clone)]
pub struct ServerInstance {
    name: String,
    base_dir: PathBuf,
}

impl ServerInstance {
    pub fn new(name: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base_dir: base_dir.into(),
        }
    }

    /// Open `<servers_dir>/<name>`; the directory must exist.
    pub fn open(servers_dir: &Path, name: &str) -> Result<Self, SupervisorError> {
        validate_name(name)?;
        let base_dir = servers_dir.join(name);
        if !base_dir.is_dir() {
            return Err(SupervisorError::InstanceNotFound(name.to_string()));
        }
        let base_dir = base_dir.canonicalize().unwrap_or(base_dir);
        Ok(Self::new(name, base_dir))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE)
    }

    pub fn properties(&self) -> PropertiesFile {
        PropertiesFile::new(self.base_dir.join(PROPERTIES_FILE))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base_dir.join(BACKUPS_DIR)
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.base_dir.join(PLUGINS_DIR)
    }

    /// First `*.jar` directly under the base directory (alphabetical).
    pub fn find_jar(&self) -> Option<PathBuf> {
        let pattern = format!("{}/*.jar", glob::Pattern::escape(&self.base_dir.to_string_lossy()));
        let mut jars: Vec<PathBuf> = glob::glob(&pattern)
            .ok()?
            .flatten()
            .filter(|p| p.is_file())
            .collect();
        jars.sort();
        jars.into_iter().next()
    }

    /// Write `eula=true` unless an eula file already exists. Returns whether it wrote one.
    pub fn ensure_eula(&self) -> Result<bool, SupervisorError> {
        let path = self.base_dir.join(EULA_FILE);
        if path.exists() {
            return Ok(false);
        }
        fs::write(&path, "eula=true\n").map_err(|e| SupervisorError::config_write(&path, e))?;
        tracing::info!("[{}] Accepted EULA ({})", self.name, path.display());
        Ok(true)
    }

    // ─── Config ──────────────────────────────────────────────

    /// Strict read: missing file is an empty config, invalid JSON is an error.
    pub fn try_load_config(&self) -> Result<InstanceConfig, SupervisorError> {
        let path = self.config_path();
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| SupervisorError::config_write(&path, format!("existing file is not valid: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(InstanceConfig::default()),
            Err(e) => Err(SupervisorError::config_write(&path, e)),
        }
    }

    /// Lenient read for display and launch: any problem yields defaults.
    pub fn load_config(&self) -> InstanceConfig {
        self.try_load_config().unwrap_or_else(|e| {
            tracing::warn!("[{}] {}; using defaults", self.name, e);
            InstanceConfig::default()
        })
    }

    pub fn save_config(&self, config: &InstanceConfig) -> Result<(), SupervisorError> {
        let path = self.config_path();
        let json = serde_json::to_string_pretty(config).map_err(|e| SupervisorError::config_write(&path, e))?;
        crate::utils::write_atomic(&path, json.as_bytes()).map_err(|e| SupervisorError::config_write(&path, e))
    }

    /// Read-modify-write of server_config.json keeping unknown keys.
    pub fn update_config<F>(&self, edit: F) -> Result<InstanceConfig, SupervisorError>
    where
        F: FnOnce(&mut InstanceConfig),
    {
        let mut config = self.try_load_config()?;
        edit(&mut config);
        self.save_config(&config)?;
        Ok(config)
    }

    /// Heap size in MB as currently configured. Not necessarily what the
    /// running JVM was launched with if the config changed since.
    pub fn max_ram_mb(&self) -> u64 {
        self.load_config().memory_mb()
    }

    pub fn set_memory(&self, memory_mb: u64) -> Result<(), SupervisorError> {
        if memory_mb == 0 {
            return Err(SupervisorError::config_write(self.config_path(), "memory must be positive"));
        }
        self.update_config(|c| c.memory = Some(memory_mb))?;
        tracing::info!("[{}] Memory set to {} MB", self.name, memory_mb);
        Ok(())
    }

    pub fn set_backup_schedule(&self, schedule: BackupSchedule) -> Result<(), SupervisorError> {
        if !(schedule.frequency > 0.0) {
            return Err(SupervisorError::config_write(
                self.config_path(),
                "backup frequency must be a positive number of hours",
            ));
        }
        self.update_config(|c| c.backup = Some(schedule))?;
        Ok(())
    }

    // ─── server.properties ───────────────────────────────────

    pub fn port(&self) -> u16 {
        self.properties()
            .get("server-port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// Address to probe; a blank `server-ip` means all interfaces.
    pub fn ip(&self) -> String {
        self.properties()
            .get("server-ip")
            .filter(|ip| !ip.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    pub fn max_players_from_properties(&self) -> u32 {
        self.properties()
            .get("max-players")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn read_properties(&self) -> Result<Vec<(String, String)>, SupervisorError> {
        let props = self.properties();
        props.read().map_err(|e| SupervisorError::config_write(props.path(), e))
    }

    pub fn update_properties(&self, patch: &[(String, String)]) -> Result<(), SupervisorError> {
        let props = self.properties();
        props
            .patch(patch, PatchMode::Upsert)
            .map_err(|e| SupervisorError::config_write(props.path(), e))?;
        Ok(())
    }

    // ─── Optimizations ───────────────────────────────────────

    pub fn optimizations(&self) -> OptimizationSettings {
        self.load_config().optimizations.unwrap_or_default()
    }

    /// Persist `settings` and apply them to the server's config files.
    pub fn save_optimizations(&self, settings: OptimizationSettings) -> Result<(), SupervisorError> {
        patcher::apply_optimizations(&self.base_dir, &settings).map_err(|e| {
            let path = e.path().map(PathBuf::from).unwrap_or_else(|| self.base_dir.clone());
            SupervisorError::config_write(path, e)
        })?;
        self.update_config(|c| c.optimizations = Some(settings))?;
        Ok(())
    }
}

/// Reject names that could escape the servers directory.
pub fn validate_name(name: &str) -> Result<(), SupervisorError> {
    let bad = name.trim().is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.');
    if bad {
        return Err(SupervisorError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Directory names under `servers_dir`, sorted. A missing directory is empty.
pub fn list_instances(servers_dir: &Path) -> std::io::Result<Vec<String>> {
    let entries = match fs::read_dir(servers_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|n| !n.starts_with('.'))
        .collect();
    names.sort();
    Ok(names)
}

/// Whether something already listens on `port` (any interface).
pub fn port_in_use(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_err()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> (tempfile::TempDir, ServerInstance) {
        let dir = tempfile::tempdir().unwrap();
        let inst = ServerInstance::new("test", dir.path());
        (dir, inst)
    }

    #[test]
    fn test_properties_readers() {
        let (_dir, inst) = instance();
        assert_eq!(inst.port(), DEFAULT_PORT);
        assert_eq!(inst.ip(), "127.0.0.1");
        assert_eq!(inst.max_players_from_properties(), 0);

        fs::write(inst.base_dir().join(PROPERTIES_FILE), "server-port=25566\nserver-ip=\nmax-players=12\n").unwrap();
        assert_eq!(inst.port(), 25566);
        assert_eq!(inst.ip(), "127.0.0.1");
        assert_eq!(inst.max_players_from_properties(), 12);
    }

    #[test]
    fn test_find_jar() {
        let (_dir, inst) = instance();
        assert!(inst.find_jar().is_none());
        fs::write(inst.base_dir().join("paper-1.20.4.jar"), b"").unwrap();
        fs::write(inst.base_dir().join("notes.txt"), b"").unwrap();
        assert_eq!(inst.find_jar().unwrap().file_name().unwrap(), "paper-1.20.4.jar");
    }

    #[test]
    fn test_memory_fallbacks() {
        let (_dir, inst) = instance();
        assert_eq!(inst.max_ram_mb(), DEFAULT_MEMORY_MB);

        fs::write(inst.config_path(), r#"{"advanced": {"memory": "3072"}}"#).unwrap();
        assert_eq!(inst.max_ram_mb(), 3072);

        fs::write(inst.config_path(), r#"{"memory": 2048, "advanced": {"memory": 3072}}"#).unwrap();
        assert_eq!(inst.max_ram_mb(), 2048);

        fs::write(inst.config_path(), "{ not json").unwrap();
        assert_eq!(inst.max_ram_mb(), DEFAULT_MEMORY_MB);
    }

    #[test]
    fn test_unknown_keys_survive_rewrite() {
        let (_dir, inst) = instance();
        fs::write(
            inst.config_path(),
            r#"{"name":"mc","memory":"1024","port":"25570","general":{"motd":"hi"},"backup":{"enabled":true,"frequency":"12","max_backups":"3"}}"#,
        )
        .unwrap();

        inst.set_memory(4096).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(inst.config_path()).unwrap()).unwrap();
        assert_eq!(raw["memory"], 4096);
        assert_eq!(raw["general"]["motd"], "hi");
        assert_eq!(raw["port"], 25570);
        let schedule = inst.load_config().backup_schedule();
        assert!(schedule.enabled);
        assert_eq!(schedule.frequency, 12.0);
        assert_eq!(schedule.max_backups, 3);
    }

    #[test]
    fn test_update_refuses_invalid_existing_file() {
        let (_dir, inst) = instance();
        fs::write(inst.config_path(), "garbage").unwrap();
        let err = inst.set_memory(1024).unwrap_err();
        assert!(matches!(err, SupervisorError::ConfigWrite { .. }));
        assert_eq!(fs::read_to_string(inst.config_path()).unwrap(), "garbage");
    }

    #[test]
    fn test_backup_schedule_validation() {
        let (_dir, inst) = instance();
        let bad = BackupSchedule {
            enabled: true,
            frequency: 0.0,
            max_backups: 5,
        };
        assert!(inst.set_backup_schedule(bad).is_err());
        let good = BackupSchedule {
            enabled: true,
            frequency: 6.0,
            max_backups: -1,
        };
        inst.set_backup_schedule(good.clone()).unwrap();
        assert_eq!(inst.load_config().backup_schedule(), good);
    }

    #[test]
    fn test_optimizations_roundtrip() {
        let (_dir, inst) = instance();
        assert_eq!(inst.optimizations(), OptimizationSettings::default());
        let mut settings = OptimizationSettings::default();
        settings.presets.insert("spigot_entity_tracking_range".into(), true);
        inst.save_optimizations(settings.clone()).unwrap();
        assert_eq!(inst.optimizations(), settings);
        assert!(inst.base_dir().join("spigot.yml").exists());
    }

    #[test]
    fn test_update_properties() {
        let (_dir, inst) = instance();
        inst.update_properties(&[("server-port".into(), "25570".into())]).unwrap();
        assert_eq!(inst.port(), 25570);
        let props = inst.read_properties().unwrap();
        assert_eq!(props, vec![("server-port".to_string(), "25570".to_string())]);
    }

    #[test]
    fn test_ensure_eula() {
        let (_dir, inst) = instance();
        assert!(inst.ensure_eula().unwrap());
        assert!(!inst.ensure_eula().unwrap());
        assert_eq!(fs::read_to_string(inst.base_dir().join(EULA_FILE)).unwrap(), "eula=true\n");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("survival_1").is_ok());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name(".hidden").is_err());
    }

    #[test]
    fn test_list_and_open() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_instances(&dir.path().join("missing")).unwrap().is_empty());
        fs::create_dir(dir.path().join("beta")).unwrap();
        fs::create_dir(dir.path().join("alpha")).unwrap();
        fs::write(dir.path().join("stray.txt"), b"").unwrap();
        assert_eq!(list_instances(dir.path()).unwrap(), vec!["alpha", "beta"]);

        assert!(ServerInstance::open(dir.path(), "alpha").is_ok());
        assert!(matches!(
            ServerInstance::open(dir.path(), "gamma"),
            Err(SupervisorError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn test_port_in_use() {
        let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use(port));
    }
}
