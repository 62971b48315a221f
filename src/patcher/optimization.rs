//! Performance settings for server.properties, bukkit.yml and spigot.yml.

use super::properties::{PatchMode, PropertiesFile};
use super::{yaml, PatchError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::path::Path;

/// Stored under `optimizations` in server_config.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSettings {
    /// server.properties keys; only keys already in the file are rewritten
    #[serde(default)]
    pub vanilla: BTreeMap<String, JsonValue>,
    /// `period-in-ticks`, `monsters`
    #[serde(default)]
    pub bukkit: BTreeMap<String, JsonValue>,
    /// `<file>_<preset>` → enabled, e.g. `spigot_item_xp_merge_radius`
    #[serde(default)]
    pub presets: BTreeMap<String, bool>,
    /// Per-preset overrides: setting → `[default, optimized]`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub preset_data: BTreeMap<String, BTreeMap<String, (JsonValue, JsonValue)>>,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        let mut vanilla = BTreeMap::new();
        vanilla.insert("simulation-distance".to_string(), JsonValue::from("10"));
        vanilla.insert("entity-broadcast-range-percentage".to_string(), JsonValue::from("100"));

        let mut bukkit = BTreeMap::new();
        bukkit.insert("period-in-ticks".to_string(), JsonValue::from("600"));
        bukkit.insert("monsters".to_string(), JsonValue::from("70"));

        Self {
            vanilla,
            bukkit,
            presets: BTreeMap::new(),
            preset_data: BTreeMap::new(),
        }
    }
}

// ─── Spigot presets ──────────────────────────────────────────

struct Preset {
    name: &'static str,
    section: &'static str,
    defaults: &'static [(&'static str, PresetValue)],
}

#[derive(Clone, Copy)]
enum PresetValue {
    Float(f64),
    Int(i64),
}

const SPIGOT_PRESETS: &[Preset] = &[
    Preset {
        name: "item_xp_merge_radius",
        section: "merge-radius",
        defaults: &[("item", PresetValue::Float(1.0)), ("exp", PresetValue::Float(1.0))],
    },
    Preset {
        name: "entity_tracking_range",
        section: "entity-tracking-range",
        defaults: &[
            ("players", PresetValue::Int(48)),
            ("animals", PresetValue::Int(48)),
            ("monsters", PresetValue::Int(48)),
            ("misc", PresetValue::Int(32)),
            ("other", PresetValue::Int(32)),
        ],
    },
    Preset {
        name: "entity_activation_range",
        section: "entity-activation-range",
        defaults: &[
            ("animals", PresetValue::Int(16)),
            ("monsters", PresetValue::Int(24)),
            ("raiders", PresetValue::Int(48)),
            ("misc", PresetValue::Int(8)),
            ("water", PresetValue::Int(8)),
            ("villagers", PresetValue::Int(16)),
            ("flying-monsters", PresetValue::Int(24)),
        ],
    },
];

fn to_yaml(value: PresetValue) -> YamlValue {
    match value {
        PresetValue::Float(f) => YamlValue::from(f),
        PresetValue::Int(i) => YamlValue::from(i),
    }
}

/// JSON settings arrive as numbers or numeric strings.
fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn parse_int(key: &str, value: &JsonValue) -> Result<i64, PatchError> {
    let text = json_text(value);
    text.parse::<i64>()
        .or_else(|_| text.parse::<f64>().map(|f| f as i64))
        .map_err(|_| PatchError::InvalidValue {
            key: key.to_string(),
            value: text,
        })
}

fn parse_float(key: &str, value: &JsonValue) -> Result<f64, PatchError> {
    let text = json_text(value);
    text.parse::<f64>().map_err(|_| PatchError::InvalidValue {
        key: key.to_string(),
        value: text,
    })
}

/// Build the spigot.yml patch for one preset, honoring user overrides.
fn preset_patch(
    preset: &Preset,
    overrides: Option<&BTreeMap<String, (JsonValue, JsonValue)>>,
) -> Result<YamlValue, PatchError> {
    let mut section = serde_yaml::Mapping::new();
    match overrides {
        Some(options) => {
            for (raw_key, (_default, optimized)) in options {
                let key = raw_key.trim().trim_end_matches(':');
                let Some((_, kind)) = preset.defaults.iter().find(|(k, _)| *k == key) else {
                    continue;
                };
                let value = match kind {
                    PresetValue::Float(_) => YamlValue::from(parse_float(key, optimized)?),
                    PresetValue::Int(_) => YamlValue::from(parse_int(key, optimized)?),
                };
                section.insert(YamlValue::from(key), value);
            }
        }
        None => {
            for (key, value) in preset.defaults {
                section.insert(YamlValue::from(*key), to_yaml(*value));
            }
        }
    }
    Ok(yaml::nested(
        &["world-settings", "default", preset.section],
        YamlValue::Mapping(section),
    ))
}

/// Write `settings` into the config files under `base_dir`.
pub fn apply_optimizations(base_dir: &Path, settings: &OptimizationSettings) -> Result<(), PatchError> {
    if !settings.vanilla.is_empty() {
        let props = PropertiesFile::new(base_dir.join("server.properties"));
        let patch: Vec<(String, String)> = settings
            .vanilla
            .iter()
            .map(|(k, v)| (k.clone(), json_text(v)))
            .collect();
        props.patch(&patch, PatchMode::ExistingOnly)?;
    }

    if !settings.bukkit.is_empty() {
        let mut patch = YamlValue::Mapping(serde_yaml::Mapping::new());
        if let Some(v) = settings.bukkit.get("period-in-ticks") {
            let ticks = parse_int("period-in-ticks", v)?;
            yaml::deep_merge(&mut patch, yaml::nested(&["chunk-gc", "period-in-ticks"], YamlValue::from(ticks)));
        }
        if let Some(v) = settings.bukkit.get("monsters") {
            let monsters = parse_int("monsters", v)?;
            yaml::deep_merge(&mut patch, yaml::nested(&["spawn-limits", "monsters"], YamlValue::from(monsters)));
        }
        yaml::patch_file(&base_dir.join("bukkit.yml"), patch)?;
    }

    for (preset_key, enabled) in &settings.presets {
        if !enabled {
            continue;
        }
        let Some((file_type, preset_name)) = preset_key.split_once('_') else {
            continue;
        };
        if file_type != "spigot" {
            tracing::debug!("Ignoring preset for unsupported file '{}'", file_type);
            continue;
        }
        let Some(preset) = SPIGOT_PRESETS.iter().find(|p| preset_name.contains(p.name)) else {
            tracing::warn!("Unknown optimization preset '{}'", preset_key);
            continue;
        };
        let patch = preset_patch(preset, settings.preset_data.get(preset_key))?;
        yaml::patch_file(&base_dir.join("spigot.yml"), patch)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_yaml(path: &Path) -> YamlValue {
        serde_yaml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = OptimizationSettings::default();
        assert_eq!(settings.vanilla["simulation-distance"], "10");
        assert_eq!(settings.bukkit["monsters"], "70");
        assert!(settings.presets.is_empty());
    }

    #[test]
    fn test_apply_vanilla_and_bukkit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("server.properties"), "simulation-distance=12\nmotd=hi\n").unwrap();

        let mut settings = OptimizationSettings::default();
        settings.vanilla.insert("simulation-distance".into(), JsonValue::from("6"));
        settings.bukkit.insert("monsters".into(), JsonValue::from(40));
        apply_optimizations(dir.path(), &settings).unwrap();

        let props = std::fs::read_to_string(dir.path().join("server.properties")).unwrap();
        assert_eq!(props, "simulation-distance=6\nmotd=hi\n");

        let bukkit = load_yaml(&dir.path().join("bukkit.yml"));
        assert_eq!(yaml::get_path(&bukkit, &["spawn-limits", "monsters"]), Some(&YamlValue::from(40)));
        assert_eq!(yaml::get_path(&bukkit, &["chunk-gc", "period-in-ticks"]), Some(&YamlValue::from(600)));
    }

    #[test]
    fn test_spigot_presets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("spigot.yml"), "settings:\n  debug: false\n").unwrap();

        let mut settings = OptimizationSettings {
            vanilla: BTreeMap::new(),
            bukkit: BTreeMap::new(),
            ..Default::default()
        };
        settings.presets.insert("spigot_item_xp_merge_radius".into(), true);
        settings.presets.insert("spigot_entity_activation_range".into(), true);
        settings.presets.insert("spigot_entity_tracking_range".into(), false);

        let mut overrides = BTreeMap::new();
        overrides.insert("monsters:".to_string(), (JsonValue::from(32), JsonValue::from("20")));
        overrides.insert("bogus".to_string(), (JsonValue::from(1), JsonValue::from(2)));
        settings
            .preset_data
            .insert("spigot_entity_activation_range".into(), overrides);

        apply_optimizations(dir.path(), &settings).unwrap();
        let spigot = load_yaml(&dir.path().join("spigot.yml"));
        let default = ["world-settings", "default"];

        assert_eq!(
            yaml::get_path(&spigot, &[default[0], default[1], "merge-radius", "item"]),
            Some(&YamlValue::from(1.0))
        );
        assert_eq!(
            yaml::get_path(&spigot, &[default[0], default[1], "entity-activation-range", "monsters"]),
            Some(&YamlValue::from(20))
        );
        assert!(yaml::get_path(&spigot, &[default[0], default[1], "entity-activation-range", "bogus"]).is_none());
        assert!(yaml::get_path(&spigot, &[default[0], default[1], "entity-tracking-range"]).is_none());
        assert_eq!(yaml::get_path(&spigot, &["settings", "debug"]), Some(&YamlValue::from(false)));
    }

    #[test]
    fn test_apply_twice_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = OptimizationSettings::default();
        settings.presets.insert("spigot_entity_tracking_range".into(), true);

        apply_optimizations(dir.path(), &settings).unwrap();
        let bukkit = std::fs::read(dir.path().join("bukkit.yml")).unwrap();
        let spigot = std::fs::read(dir.path().join("spigot.yml")).unwrap();
        apply_optimizations(dir.path(), &settings).unwrap();
        assert_eq!(std::fs::read(dir.path().join("bukkit.yml")).unwrap(), bukkit);
        assert_eq!(std::fs::read(dir.path().join("spigot.yml")).unwrap(), spigot);
        // no server.properties → vanilla keys are not written anywhere
        assert!(!dir.path().join("server.properties").exists());
    }

    #[test]
    fn test_invalid_number() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = OptimizationSettings::default();
        settings.bukkit.insert("monsters".into(), JsonValue::from("lots"));
        assert!(matches!(
            apply_optimizations(dir.path(), &settings),
            Err(PatchError::InvalidValue { .. })
        ));
    }
}
