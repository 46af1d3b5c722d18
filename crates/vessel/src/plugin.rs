//! The plugin callback registry.
//!
//! External collaborators contribute behavior through typed callbacks
//! registered before Create. The registry is keyed by capability:
//! image drivers, the monitor replacement and post-start callbacks.
//! The "at most one monitor override" rule is enforced at registration
//! time, not at call time.

use std::sync::Arc;

use parking_lot::RwLock;
use vessel_common::{EngineConfig, VesselError, VesselResult};

use crate::image::ImageDriver;
use crate::lifecycle::SignalSource;

/// Full replacement of the default container monitoring behavior.
pub trait MonitorOverride: Send + Sync {
    /// Supervise the container until it exits, returning its status.
    fn monitor_container(
        &self,
        config: &EngineConfig,
        pid: i32,
        signals: &mut SignalSource,
    ) -> VesselResult<i32>;
}

/// Invoked after the container process starts, before instance
/// metadata is persisted.
pub trait PostStartCallback: Send + Sync {
    /// React to the started container.
    fn post_start(&self, config: &EngineConfig, pid: i32) -> VesselResult<()>;
}

/// Registered callbacks, keyed by capability.
#[derive(Default)]
pub struct PluginRegistry {
    image_drivers: RwLock<Vec<Arc<dyn ImageDriver>>>,
    monitor: RwLock<Option<Arc<dyn MonitorOverride>>>,
    post_start: RwLock<Vec<Arc<dyn PostStartCallback>>>,
}

impl PluginRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image driver.
    ///
    /// `unprivileged` declares that the driver works without the
    /// privileged helper; it is recorded for the session builder's
    /// feature queries.
    pub fn register_image_driver(
        &self,
        driver: Arc<dyn ImageDriver>,
        unprivileged: bool,
    ) -> VesselResult<()> {
        let mut drivers = self.image_drivers.write();
        if drivers.iter().any(|d| d.name() == driver.name()) {
            return Err(VesselError::Config {
                message: format!("image driver '{}' is already registered", driver.name()),
            });
        }

        tracing::debug!(
            name = driver.name(),
            unprivileged,
            features = ?driver.features(),
            "Registered image driver"
        );
        drivers.push(driver);
        Ok(())
    }

    /// Look up an image driver by name.
    #[must_use]
    pub fn image_driver(&self, name: &str) -> Option<Arc<dyn ImageDriver>> {
        self.image_drivers
            .read()
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// Every registered image driver, for cleanup's stop pass.
    #[must_use]
    pub fn image_drivers(&self) -> Vec<Arc<dyn ImageDriver>> {
        self.image_drivers.read().clone()
    }

    /// Register a monitor replacement.
    ///
    /// At most one plugin may replace monitoring system-wide; a second
    /// registration is a fatal configuration error.
    pub fn register_monitor(&self, monitor: Arc<dyn MonitorOverride>) -> VesselResult<()> {
        let mut slot = self.monitor.write();
        if slot.is_some() {
            return Err(VesselError::Config {
                message: "multiple plugins have registered callback 'monitor container'"
                    .to_string(),
            });
        }
        *slot = Some(monitor);
        Ok(())
    }

    /// The registered monitor replacement, if any.
    #[must_use]
    pub fn monitor(&self) -> Option<Arc<dyn MonitorOverride>> {
        self.monitor.read().clone()
    }

    /// Register a post-start callback.
    pub fn register_post_start(&self, callback: Arc<dyn PostStartCallback>) {
        self.post_start.write().push(callback);
    }

    /// Post-start callbacks in registration order.
    #[must_use]
    pub fn post_start_callbacks(&self) -> Vec<Arc<dyn PostStartCallback>> {
        self.post_start.read().clone()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("image_drivers", &self.image_drivers.read().len())
            .field("monitor", &self.monitor.read().is_some())
            .field("post_start", &self.post_start.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullMonitor;
    impl MonitorOverride for NullMonitor {
        fn monitor_container(
            &self,
            _config: &EngineConfig,
            _pid: i32,
            _signals: &mut SignalSource,
        ) -> VesselResult<i32> {
            Ok(0)
        }
    }

    #[test]
    fn second_monitor_registration_is_fatal() {
        let registry = PluginRegistry::new();
        registry.register_monitor(Arc::new(NullMonitor)).unwrap();

        let err = registry
            .register_monitor(Arc::new(NullMonitor))
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("multiple plugins have registered callback"));
    }

    #[test]
    fn duplicate_driver_name_is_rejected() {
        let registry = PluginRegistry::new();
        registry
            .register_image_driver(Arc::new(crate::image::LoopAttachDriver), false)
            .unwrap();

        let err = registry
            .register_image_driver(Arc::new(crate::image::LoopAttachDriver), false)
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn driver_lookup_by_name() {
        let registry = PluginRegistry::new();
        registry
            .register_image_driver(Arc::new(crate::image::LoopAttachDriver), false)
            .unwrap();

        assert!(registry.image_driver("loop").is_some());
        assert!(registry.image_driver("fuse2fs").is_none());
    }
}
