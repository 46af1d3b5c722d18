//! Administrator configuration directives.
//!
//! The engine configuration is a flat `directive = value` file owned by
//! the administrator. Every directive has a fixed default; unknown
//! directives and malformed values are load errors, never silently
//! ignored.

use std::path::Path;

use serde::Serialize;

use crate::error::{VesselError, VesselResult};

/// Overlay enablement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum OverlayMode {
    /// Overlay is always used; failure to mount one is an error.
    Yes,
    /// Overlay is never used.
    No,
    /// Overlay is used when the kernel supports it.
    #[default]
    Try,
    /// Overlay handling is delegated to the configured image driver.
    Driver,
}

/// Underlay enablement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum UnderlayMode {
    /// Underlay is available as a fallback.
    #[default]
    Yes,
    /// Underlay is never used.
    No,
    /// Underlay is preferred over overlay.
    Preferred,
}

/// How /dev is populated inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DevMode {
    /// Bind the host /dev.
    #[default]
    Yes,
    /// Create a minimal devtmpfs with a fixed node set.
    Minimal,
    /// No /dev handling.
    No,
}

/// Policy for capabilities granted to root-owned containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RootCapPolicy {
    /// Root keeps the full capability set.
    #[default]
    Full,
    /// Root gets only the capabilities listed in the policy file.
    File,
    /// Root gets no capabilities.
    No,
}

/// Administrator configuration for the engine.
///
/// Field defaults match the stock configuration file shipped with the
/// engine; [`EngineConfig::load`] overrides them from disk.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Allow use of the setuid starter.
    pub allow_setuid: bool,
    /// Allow PID namespace requests.
    pub allow_pid_ns: bool,
    /// Allow UTS namespace requests.
    pub allow_uts_ns: bool,
    /// Allow IPC namespace requests.
    pub allow_ipc_ns: bool,
    /// Allow user namespace requests.
    pub allow_user_ns: bool,
    /// Allow network namespace requests.
    pub allow_net_ns: bool,
    /// Mount /proc inside containers.
    pub mount_proc: bool,
    /// Mount /sys inside containers.
    pub mount_sys: bool,
    /// How to populate /dev inside containers.
    pub mount_dev: DevMode,
    /// Mount a fresh devpts when a PID namespace is used.
    pub mount_devpts: bool,
    /// Bind the invoking user's home directory.
    pub mount_home: bool,
    /// Mount a tmpfs-backed /tmp and /var/tmp.
    pub mount_tmp: bool,
    /// Probe and bind non-system host filesystems.
    pub mount_hostfs: bool,
    /// Allow users to request their own bind mounts.
    pub user_bind_control: bool,
    /// Overlay enablement.
    pub enable_overlay: OverlayMode,
    /// Underlay enablement.
    pub enable_underlay: UnderlayMode,
    /// Propagate host mounts into the container as slave mounts.
    pub mount_slave: bool,
    /// Maximum number of loop devices the engine may claim.
    pub max_loop_devices: u32,
    /// Reuse loop devices across identical image attachments.
    pub shared_loop_devices: bool,
    /// Size limit for the tmpfs session directory, in MiB.
    pub sessiondir_max_size: u64,
    /// Capabilities granted to root-owned containers.
    pub root_default_capabilities: RootCapPolicy,
    /// Allow squashfs images.
    pub allow_container_squashfs: bool,
    /// Allow extfs images.
    pub allow_container_extfs: bool,
    /// Allow sandbox directory images.
    pub allow_container_dir: bool,
    /// Allow encrypted images.
    pub allow_container_encrypted: bool,
    /// Name of an alternative image driver, empty for the built-in one.
    pub image_driver: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allow_setuid: true,
            allow_pid_ns: true,
            allow_uts_ns: true,
            allow_ipc_ns: true,
            allow_user_ns: true,
            allow_net_ns: false,
            mount_proc: true,
            mount_sys: true,
            mount_dev: DevMode::Yes,
            mount_devpts: true,
            mount_home: true,
            mount_tmp: true,
            mount_hostfs: false,
            user_bind_control: true,
            enable_overlay: OverlayMode::Try,
            enable_underlay: UnderlayMode::Yes,
            mount_slave: true,
            max_loop_devices: 256,
            shared_loop_devices: false,
            sessiondir_max_size: 64,
            root_default_capabilities: RootCapPolicy::Full,
            allow_container_squashfs: true,
            allow_container_extfs: true,
            allow_container_dir: true,
            allow_container_encrypted: true,
            image_driver: String::new(),
        }
    }
}

impl EngineConfig {
    /// Load the configuration from a directive file.
    pub fn load(path: &Path) -> VesselResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| VesselError::Config {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        let config = Self::parse(&content)?;

        tracing::debug!(path = %path.display(), "Loaded engine configuration");
        Ok(config)
    }

    /// Parse configuration directives from a string.
    pub fn parse(content: &str) -> VesselResult<Self> {
        let mut config = Self::default();

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| VesselError::Config {
                message: format!("line {}: expected 'directive = value'", lineno + 1),
            })?;
            let key = key.trim();
            let value = value.trim();

            config.apply_directive(key, value).map_err(|e| match e {
                VesselError::Config { message } => VesselError::Config {
                    message: format!("line {}: {}", lineno + 1, message),
                },
                other => other,
            })?;
        }

        Ok(config)
    }

    fn apply_directive(&mut self, key: &str, value: &str) -> VesselResult<()> {
        match key {
            "allow setuid" => self.allow_setuid = parse_bool(key, value)?,
            "allow pid ns" => self.allow_pid_ns = parse_bool(key, value)?,
            "allow uts ns" => self.allow_uts_ns = parse_bool(key, value)?,
            "allow ipc ns" => self.allow_ipc_ns = parse_bool(key, value)?,
            "allow user ns" => self.allow_user_ns = parse_bool(key, value)?,
            "allow net ns" => self.allow_net_ns = parse_bool(key, value)?,
            "mount proc" => self.mount_proc = parse_bool(key, value)?,
            "mount sys" => self.mount_sys = parse_bool(key, value)?,
            "mount dev" => {
                self.mount_dev = match value {
                    "yes" => DevMode::Yes,
                    "minimal" => DevMode::Minimal,
                    "no" => DevMode::No,
                    other => {
                        return Err(VesselError::Config {
                            message: format!("'{key}': expected yes/minimal/no, got '{other}'"),
                        });
                    }
                }
            }
            "mount devpts" => self.mount_devpts = parse_bool(key, value)?,
            "mount home" => self.mount_home = parse_bool(key, value)?,
            "mount tmp" => self.mount_tmp = parse_bool(key, value)?,
            "mount hostfs" => self.mount_hostfs = parse_bool(key, value)?,
            "user bind control" => self.user_bind_control = parse_bool(key, value)?,
            "enable overlay" => {
                self.enable_overlay = match value {
                    "yes" => OverlayMode::Yes,
                    "no" => OverlayMode::No,
                    "try" => OverlayMode::Try,
                    "driver" => OverlayMode::Driver,
                    other => {
                        return Err(VesselError::Config {
                            message: format!("'{key}': expected yes/no/try/driver, got '{other}'"),
                        });
                    }
                }
            }
            "enable underlay" => {
                self.enable_underlay = match value {
                    "yes" => UnderlayMode::Yes,
                    "no" => UnderlayMode::No,
                    "preferred" => UnderlayMode::Preferred,
                    other => {
                        return Err(VesselError::Config {
                            message: format!("'{key}': expected yes/no/preferred, got '{other}'"),
                        });
                    }
                }
            }
            "mount slave" => self.mount_slave = parse_bool(key, value)?,
            "max loop devices" => {
                self.max_loop_devices = value.parse().map_err(|_| VesselError::Config {
                    message: format!("'{key}': expected an integer, got '{value}'"),
                })?;
            }
            "shared loop devices" => self.shared_loop_devices = parse_bool(key, value)?,
            "sessiondir max size" => {
                self.sessiondir_max_size = value.parse().map_err(|_| VesselError::Config {
                    message: format!("'{key}': expected a size in MiB, got '{value}'"),
                })?;
            }
            "root default capabilities" => {
                self.root_default_capabilities = match value {
                    "full" => RootCapPolicy::Full,
                    "file" => RootCapPolicy::File,
                    "no" => RootCapPolicy::No,
                    other => {
                        return Err(VesselError::Config {
                            message: format!("'{key}': expected full/file/no, got '{other}'"),
                        });
                    }
                }
            }
            "allow container squashfs" => self.allow_container_squashfs = parse_bool(key, value)?,
            "allow container extfs" => self.allow_container_extfs = parse_bool(key, value)?,
            "allow container dir" => self.allow_container_dir = parse_bool(key, value)?,
            "allow container encrypted" => self.allow_container_encrypted = parse_bool(key, value)?,
            "image driver" => self.image_driver = value.to_string(),
            other => {
                return Err(VesselError::Config {
                    message: format!("unknown directive '{other}'"),
                });
            }
        }

        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> VesselResult<bool> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(VesselError::Config {
            message: format!("'{key}': expected yes or no, got '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert!(config.allow_setuid);
        assert_eq!(config.enable_overlay, OverlayMode::Try);
        assert_eq!(config.max_loop_devices, 256);
        assert_eq!(config.root_default_capabilities, RootCapPolicy::Full);
    }

    #[test]
    fn parse_directives() {
        let config = EngineConfig::parse(
            "# comment\n\
             allow setuid = no\n\
             enable overlay = driver\n\
             max loop devices = 16\n\
             mount dev = minimal\n",
        )
        .unwrap();

        assert!(!config.allow_setuid);
        assert_eq!(config.enable_overlay, OverlayMode::Driver);
        assert_eq!(config.max_loop_devices, 16);
        assert_eq!(config.mount_dev, DevMode::Minimal);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vessel.conf");
        std::fs::write(&path, "shared loop devices = yes\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert!(config.shared_loop_devices);

        assert!(EngineConfig::load(&dir.path().join("missing.conf")).is_err());
    }

    #[test]
    fn unknown_directive_is_an_error() {
        let err = EngineConfig::parse("mount var = yes\n").unwrap_err();
        assert!(err.to_string().contains("unknown directive"));
    }

    #[test]
    fn malformed_value_is_an_error() {
        let err = EngineConfig::parse("allow setuid = maybe\n").unwrap_err();
        assert!(err.to_string().contains("expected yes or no"));
    }

    #[test]
    fn missing_equals_is_an_error() {
        assert!(EngineConfig::parse("allow setuid yes\n").is_err());
    }
}
