//! Configuration loading for presetd.
//!
//! The config file is TOML with three sections:
//! 1. `[general]` - supervisor-wide switches
//! 2. `[defaults]` - preset fields inherited by every preset that leaves them unset
//! 3. `[[presets]]` - the named presets, in menu order
//!
//! Hook commands are written as shell-like strings and tokenised into argv
//! here, so nothing downstream has to deal with quoting.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Control port used when neither the preset nor `[defaults]` set one.
pub const DEFAULT_TCP_PORT: u16 = 5829;

/// Written to disk when no config file exists yet.
pub const DEFAULT_CONFIG: &str = r#"# presetd configuration

[general]
allow_concurrent_presets = false

[defaults]
tcp_port = 5829

[defaults.hooks]
# Each hook is a command line, e.g. "notify-send 'preset started'".
# Hooks of one kind run concurrently.
pre-start = []
post-start = []
post-start-async = []
post-stop = []

[[presets]]
name = "Default Preset"
executable = ""
config = ""
autorun = false
"#;

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    pub general: GeneralConfig,
    pub presets: Vec<Preset>,
}

/// Supervisor-wide switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Allow more than one preset to run at the same time.
    #[serde(default)]
    pub allow_concurrent_presets: bool,
}

/// A named worker configuration with all defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    pub name: String,
    /// Worker executable. `None` means look it up on `PATH`.
    pub executable: Option<PathBuf>,
    /// Worker config file passed with `-c`.
    pub config: Option<PathBuf>,
    pub tcp_port: u16,
    pub autorun: bool,
    pub autorestart_on_crash: bool,
    pub extra_args: Vec<String>,
    pub hooks: Hooks,
}

/// Hook commands for each lifecycle phase, already split into argv.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hooks {
    pub pre_start: Vec<Vec<String>>,
    pub post_start: Vec<Vec<String>>,
    pub post_start_async: Vec<Vec<String>>,
    pub post_stop: Vec<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    general: GeneralConfig,
    #[serde(default)]
    defaults: PresetFile,
    #[serde(default)]
    presets: Vec<PresetFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PresetFile {
    name: Option<String>,
    executable: Option<String>,
    config: Option<String>,
    tcp_port: Option<u16>,
    autorun: Option<bool>,
    autorestart_on_crash: Option<bool>,
    extra_args: Option<Vec<String>>,
    hooks: Option<HooksFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct HooksFile {
    #[serde(default)]
    pre_start: Vec<String>,
    #[serde(default)]
    post_start: Vec<String>,
    #[serde(default)]
    post_start_async: Vec<String>,
    #[serde(default)]
    post_stop: Vec<String>,
}

impl PresetFile {
    fn apply_defaults(&mut self, defaults: &Self) {
        if self.executable.is_none() {
            self.executable.clone_from(&defaults.executable);
        }
        if self.config.is_none() {
            self.config.clone_from(&defaults.config);
        }
        if self.tcp_port.is_none() {
            self.tcp_port = defaults.tcp_port;
        }
        if self.autorun.is_none() {
            self.autorun = defaults.autorun;
        }
        if self.autorestart_on_crash.is_none() {
            self.autorestart_on_crash = defaults.autorestart_on_crash;
        }
        if self.extra_args.is_none() {
            self.extra_args.clone_from(&defaults.extra_args);
        }
        if self.hooks.is_none() {
            self.hooks.clone_from(&defaults.hooks);
        }
    }

    fn resolve(self, index: usize) -> Result<Preset> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| Error::Config(format!("preset #{index} has no name")))?;

        let extra_args = self.extra_args.unwrap_or_default();
        if let Some(arg) = extra_args
            .iter()
            .find(|a| a.starts_with("--port") || a.starts_with("-p"))
        {
            return Err(Error::Config(format!(
                "preset '{name}': port argument '{arg}' is not allowed in extra_args, use tcp_port instead"
            )));
        }

        let hooks = match self.hooks {
            Some(hooks) => hooks.resolve(&name)?,
            None => Hooks::default(),
        };

        Ok(Preset {
            executable: non_empty_path(self.executable),
            config: non_empty_path(self.config),
            tcp_port: self.tcp_port.unwrap_or(DEFAULT_TCP_PORT),
            autorun: self.autorun.unwrap_or(false),
            autorestart_on_crash: self.autorestart_on_crash.unwrap_or(false),
            extra_args,
            hooks,
            name,
        })
    }
}

impl HooksFile {
    fn resolve(self, preset: &str) -> Result<Hooks> {
        let split_all = |phase: &str, cmds: Vec<String>| -> Result<Vec<Vec<String>>> {
            cmds.iter()
                .map(|cmd| {
                    split_command(cmd).map_err(|e| match e {
                        Error::Config(reason) => Error::Config(format!(
                            "preset '{preset}': failed to parse {phase} hook command '{cmd}': {reason}"
                        )),
                        other => other,
                    })
                })
                .collect()
        };
        Ok(Hooks {
            pre_start: split_all("pre-start", self.pre_start)?,
            post_start: split_all("post-start", self.post_start)?,
            post_start_async: split_all("post-start-async", self.post_start_async)?,
            post_stop: split_all("post-stop", self.post_stop)?,
        })
    }
}

fn non_empty_path(value: Option<String>) -> Option<PathBuf> {
    value.filter(|v| !v.is_empty()).map(PathBuf::from)
}

impl Config {
    /// Parse and resolve a config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;

        let mut seen = HashSet::new();
        let mut presets = Vec::with_capacity(file.presets.len());
        for (index, mut preset) in file.presets.into_iter().enumerate() {
            preset.apply_defaults(&file.defaults);
            let preset = preset.resolve(index)?;
            if !seen.insert(preset.name.clone()) {
                return Err(Error::Config(format!(
                    "duplicate preset name '{}'",
                    preset.name
                )));
            }
            presets.push(preset);
        }

        Ok(Self {
            general: file.general,
            presets,
        })
    }

    /// Load a config file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load a config file, writing [`DEFAULT_CONFIG`] first if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, DEFAULT_CONFIG)?;
            tracing::info!(path = %path.display(), "Wrote default config");
        }
        Self::load(path)
    }

    /// Look up a preset by name.
    pub fn preset(&self, name: &str) -> Option<&Preset> {
        self.presets.iter().find(|p| p.name == name)
    }
}

/// Split a command line into argv with POSIX shell quoting rules.
///
/// A command with no words is rejected.
pub fn split_command(cmd: &str) -> Result<Vec<String>> {
    let args = shell_words::split(cmd).map_err(|e| Error::Config(e.to_string()))?;
    if args.is_empty() {
        return Err(Error::Config("empty command".to_string()));
    }
    Ok(args)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_parses() {
        let config = Config::from_toml_str(DEFAULT_CONFIG).unwrap();
        assert!(!config.general.allow_concurrent_presets);
        assert_eq!(config.presets.len(), 1);
        let preset = &config.presets[0];
        assert_eq!(preset.name, "Default Preset");
        assert_eq!(preset.executable, None);
        assert_eq!(preset.config, None);
        assert_eq!(preset.tcp_port, DEFAULT_TCP_PORT);
        assert!(!preset.autorun);
        assert_eq!(preset.hooks, Hooks::default());
    }

    #[test]
    fn presets_inherit_defaults_field_by_field() {
        let config = Config::from_toml_str(
            r#"
[general]
allow_concurrent_presets = true

[defaults]
tcp_port = 6000
executable = "/usr/bin/kanata"
autorestart_on_crash = true
extra_args = ["--nodelay"]

[defaults.hooks]
pre-start = ["notify-send 'starting up'"]

[[presets]]
name = "main"
config = "/etc/main.kbd"

[[presets]]
name = "gaming"
tcp_port = 6001
autorestart_on_crash = false
extra_args = []

[presets.hooks]
post-stop = ["echo done"]
"#,
        )
        .unwrap();

        assert!(config.general.allow_concurrent_presets);
        let main = config.preset("main").unwrap();
        assert_eq!(main.tcp_port, 6000);
        assert_eq!(main.executable, Some(PathBuf::from("/usr/bin/kanata")));
        assert_eq!(main.config, Some(PathBuf::from("/etc/main.kbd")));
        assert!(main.autorestart_on_crash);
        assert_eq!(main.extra_args, vec!["--nodelay"]);
        assert_eq!(
            main.hooks.pre_start,
            vec![vec!["notify-send".to_string(), "starting up".to_string()]]
        );

        let gaming = config.preset("gaming").unwrap();
        assert_eq!(gaming.tcp_port, 6001);
        assert!(!gaming.autorestart_on_crash);
        assert!(gaming.extra_args.is_empty());
        // hooks are inherited as a whole, not merged
        assert!(gaming.hooks.pre_start.is_empty());
        assert_eq!(gaming.hooks.post_stop, vec![vec!["echo", "done"]]);
    }

    #[test]
    fn port_in_extra_args_is_rejected() {
        let err = Config::from_toml_str(
            r#"
[[presets]]
name = "main"
extra_args = ["--port", "1234"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tcp_port"));
    }

    #[test]
    fn duplicate_preset_names_are_rejected() {
        let err = Config::from_toml_str(
            r#"
[[presets]]
name = "a"

[[presets]]
name = "a"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn unnamed_preset_is_rejected() {
        assert!(Config::from_toml_str("[[presets]]\nautorun = true\n").is_err());
    }

    #[test]
    fn bad_hook_command_is_rejected() {
        let err = Config::from_toml_str(
            r#"
[[presets]]
name = "a"
[presets.hooks]
post-start = ["echo 'oops"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("post-start"));
    }

    #[test]
    fn split_command_handles_quotes() {
        assert_eq!(
            split_command(r#"notify-send "kanata  started" 'on nav'"#).unwrap(),
            vec!["notify-send", "kanata  started", "on nav"]
        );
        assert_eq!(split_command("  ls   -la ").unwrap(), vec!["ls", "-la"]);
        assert_eq!(split_command(r#"echo """#).unwrap(), vec!["echo", ""]);
        assert!(split_command("echo 'x").is_err());
        assert!(split_command("   ").is_err());
    }

    #[test]
    fn split_command_handles_backslash_escapes() {
        assert_eq!(
            split_command(r#"echo "say \"hi\"""#).unwrap(),
            vec!["echo", r#"say "hi""#]
        );
        assert_eq!(split_command(r"echo don\'t").unwrap(), vec!["echo", "don't"]);
        assert_eq!(
            split_command(r"touch /tmp/a\ b").unwrap(),
            vec!["touch", "/tmp/a b"]
        );
    }

    #[test]
    fn escaped_hook_command_survives_config_load() {
        let config = Config::from_toml_str(
            r#"
[[presets]]
name = "a"
[presets.hooks]
pre-start = ['touch /tmp/presetd\ marker', 'notify-send "kanata \"nav\" layer"']
"#,
        )
        .unwrap();
        assert_eq!(
            config.presets[0].hooks.pre_start,
            vec![
                vec!["touch".to_string(), "/tmp/presetd marker".to_string()],
                vec!["notify-send".to_string(), r#"kanata "nav" layer"#.to_string()],
            ]
        );
    }

    #[test]
    fn load_or_create_writes_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("presetd.toml");
        let config = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.presets.len(), 1);

        std::fs::write(&path, "[[presets]]\nname = \"custom\"\n").unwrap();
        let config = Config::load_or_create(&path).unwrap();
        assert_eq!(config.presets[0].name, "custom");
    }
}
