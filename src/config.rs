use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::catalog::CatalogEntry;
use crate::logging::LogLevel;

const ENV_PREFIX: &str = "ISOFLASH_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: LogLevel,
    pub json_logs: bool,
    pub simulation: bool,
    /// Passed verbatim as dd's `bs=` operand.
    pub block_size: String,
    pub tools: ToolPaths,
    pub privileges: PrivilegeConfig,
    pub ventoy: VentoyConfig,
    pub catalog: Vec<CatalogEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            simulation: false,
            block_size: "4M".to_string(),
            tools: ToolPaths::default(),
            privileges: PrivilegeConfig::default(),
            ventoy: VentoyConfig::default(),
            catalog: Vec::new(),
        }
    }
}

/// External programs, resolved through `PATH` unless given absolutely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub lsblk: PathBuf,
    pub dd: PathBuf,
    pub parted: PathBuf,
    pub mount: PathBuf,
    pub umount: PathBuf,
    pub sync: PathBuf,
    /// Interpreter for the Ventoy installer script.
    pub shell: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            lsblk: PathBuf::from("lsblk"),
            dd: PathBuf::from("dd"),
            parted: PathBuf::from("parted"),
            mount: PathBuf::from("mount"),
            umount: PathBuf::from("umount"),
            sync: PathBuf::from("sync"),
            shell: PathBuf::from("sh"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationMode {
    /// Run directly as root, otherwise through `escalate_with`.
    Auto,
    /// Run tools as the current user without any privilege check.
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegeConfig {
    pub mode: ElevationMode,
    pub escalate_with: Vec<String>,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            mode: ElevationMode::Auto,
            escalate_with: vec!["sudo".to_string(), "-n".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VentoyConfig {
    /// Path to `Ventoy2Disk.sh` from an extracted Ventoy release.
    pub installer: Option<PathBuf>,
    /// How long to wait for the Ventoy data partition to show up.
    pub settle_timeout_secs: u64,
}

impl Default for VentoyConfig {
    fn default() -> Self {
        Self {
            installer: None,
            settle_timeout_secs: 10,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `ISOFLASH_*` environment variables and
    /// CLI overrides, in increasing precedence.
    ///
    /// An explicitly named file must exist; the default location is optional.
    pub fn load<T: Serialize>(path: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        match path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    figment = figment.merge(Toml::file(default_path));
                }
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract().context("Failed to load configuration")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.to_toml()?).context("Failed to write config file")?;
        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/isoflash/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("isoflash").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Overrides {
        simulation: bool,
    }

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.block_size, "4M");
        assert_eq!(config.privileges.mode, ElevationMode::Auto);
        assert_eq!(config.privileges.escalate_with, vec!["sudo", "-n"]);
        assert_eq!(config.tools.dd, PathBuf::from("dd"));
        assert!(config.ventoy.installer.is_none());
    }

    #[test]
    fn file_and_overrides_are_layered() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
block_size = "1M"
simulation = false

[tools]
dd = "/opt/bin/dd"

[ventoy]
installer = "/opt/ventoy/Ventoy2Disk.sh"

[[catalog]]
name = "Arch Linux"
url = "https://mirror.rackspace.com/archlinux/iso/latest/archlinux-x86_64.iso"
sha256 = "abc123"
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path), Some(&Overrides { simulation: true })).unwrap();

        assert_eq!(config.block_size, "1M");
        assert!(config.simulation);
        assert_eq!(config.tools.dd, PathBuf::from("/opt/bin/dd"));
        // Untouched tools keep their defaults
        assert_eq!(config.tools.parted, PathBuf::from("parted"));
        assert_eq!(
            config.ventoy.installer,
            Some(PathBuf::from("/opt/ventoy/Ventoy2Disk.sh"))
        );
        assert_eq!(config.catalog.len(), 1);
        assert_eq!(config.catalog[0].name, "Arch Linux");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = AppConfig::load::<Overrides>(Some(Path::new("/nonexistent/isoflash.toml")), None);
        assert!(result.is_err());
    }

    #[test]
    fn config_round_trips_through_toml_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested/config.toml");
        let mut config = AppConfig::default();
        config.block_size = "8M".to_string();
        config.write_to(&path).unwrap();

        let loaded = AppConfig::load::<Overrides>(Some(&path), None).unwrap();
        assert_eq!(loaded.block_size, "8M");
    }
}
