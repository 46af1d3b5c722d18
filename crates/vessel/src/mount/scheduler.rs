//! Tag-ordered schedule execution.

use vessel_common::VesselResult;

use super::{MountExecutor, Registry, Tag};

/// A callback interleaved with mount application at a tag boundary.
///
/// Hooks fire exactly once and are discarded with the scheduler after
/// one creation pass. They receive the registry so they can submit
/// mount points for tags that have not been applied yet, and the
/// executor so non-mount work (staging directories, probing mounted
/// content) can reach the same boundary the mounts go through.
pub type Hook<E> = Box<dyn FnOnce(&mut Registry, &mut E) -> VesselResult<()> + Send>;

/// Executes registered hooks interleaved with mount-point application,
/// producing a deterministic global ordering.
///
/// The tag sequence is fixed at design time ([`Tag::ORDER`]); hooks
/// attached to the same point fire in registration order. Given the
/// same registered mount points and hooks, two runs produce an
/// identical concrete operation sequence.
pub struct Scheduler<E: MountExecutor> {
    before: Vec<(Tag, Hook<E>)>,
    after: Vec<(Tag, Hook<E>)>,
}

impl<E: MountExecutor> Default for Scheduler<E> {
    fn default() -> Self {
        Self {
            before: Vec::new(),
            after: Vec::new(),
        }
    }
}

impl<E: MountExecutor> Scheduler<E> {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook to run before any mount under `tag` is applied.
    pub fn run_before_tag(
        &mut self,
        tag: Tag,
        hook: impl FnOnce(&mut Registry, &mut E) -> VesselResult<()> + Send + 'static,
    ) {
        self.before.push((tag, Box::new(hook)));
    }

    /// Register a hook to run after every mount under `tag` has applied.
    pub fn run_after_tag(
        &mut self,
        tag: Tag,
        hook: impl FnOnce(&mut Registry, &mut E) -> VesselResult<()> + Send + 'static,
    ) {
        self.after.push((tag, Box::new(hook)));
    }

    /// Drain the registry in tag order, firing hooks at their
    /// attachment points and delegating each mount to `executor`.
    ///
    /// Consumes the scheduler: hooks fire exactly once.
    pub fn run(mut self, registry: &mut Registry, executor: &mut E) -> VesselResult<()> {
        for tag in Tag::ORDER {
            for hook in Self::take_hooks(&mut self.before, tag) {
                hook(registry, executor)?;
            }

            registry.apply_tag(tag, executor)?;

            for hook in Self::take_hooks(&mut self.after, tag) {
                hook(registry, executor)?;
            }
        }

        Ok(())
    }

    /// Remove and return the hooks attached to `tag`, preserving
    /// registration order.
    fn take_hooks(hooks: &mut Vec<(Tag, Hook<E>)>, tag: Tag) -> Vec<Hook<E>> {
        let mut taken = Vec::new();
        let mut rest = Vec::with_capacity(hooks.len());
        for (t, hook) in hooks.drain(..) {
            if t == tag {
                taken.push(hook);
            } else {
                rest.push((t, hook));
            }
        }
        *hooks = rest;
        taken
    }
}

impl<E: MountExecutor> std::fmt::Debug for Scheduler<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("before_hooks", &self.before.len())
            .field("after_hooks", &self.after.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountPoint;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct OrderExecutor {
        order: Vec<String>,
    }

    impl MountExecutor for OrderExecutor {
        fn mount(&mut self, point: &MountPoint) -> VesselResult<()> {
            self.order
                .push(format!("mount:{}", point.destination.display()));
            Ok(())
        }
    }

    #[test]
    fn hooks_interleave_with_tag_batches() {
        let events = Arc::new(Mutex::new(Vec::new()));

        let mut registry = Registry::new();
        registry
            .add(Tag::Kernel, MountPoint::filesystem("proc", "/proc"))
            .unwrap();
        registry
            .add(Tag::Files, MountPoint::bind("/s/passwd", "/etc/passwd"))
            .unwrap();

        let mut scheduler = Scheduler::new();
        let ev = events.clone();
        scheduler.run_before_tag(Tag::Files, move |_, _| {
            ev.lock().unwrap().push("before-files".to_string());
            Ok(())
        });
        let ev = events.clone();
        scheduler.run_after_tag(Tag::Kernel, move |_, _| {
            ev.lock().unwrap().push("after-kernel".to_string());
            Ok(())
        });

        let mut exec = OrderExecutor::default();
        scheduler.run(&mut registry, &mut exec).unwrap();

        assert_eq!(exec.order, vec!["mount:/proc", "mount:/etc/passwd"]);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["after-kernel".to_string(), "before-files".to_string()]
        );
    }

    #[test]
    fn hooks_fire_in_registration_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        let mut scheduler = Scheduler::new();

        for i in 0..3 {
            let ev = events.clone();
            scheduler.run_before_tag(Tag::Binds, move |_, _| {
                ev.lock().unwrap().push(i);
                Ok(())
            });
        }

        let mut exec = OrderExecutor::default();
        scheduler.run(&mut registry, &mut exec).unwrap();
        assert_eq!(*events.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn hook_can_add_points_for_later_tags() {
        let mut registry = Registry::new();
        let mut scheduler = Scheduler::new();

        scheduler.run_after_tag(Tag::Kernel, |registry: &mut Registry, _: &mut OrderExecutor| {
            registry.add(Tag::Files, MountPoint::bind("/s/group", "/etc/group"))
        });

        let mut exec = OrderExecutor::default();
        scheduler.run(&mut registry, &mut exec).unwrap();
        assert_eq!(exec.order, vec!["mount:/etc/group"]);
    }

    #[test]
    fn hook_failure_aborts_the_schedule() {
        let mut registry = Registry::new();
        registry
            .add(Tag::Files, MountPoint::bind("/s/passwd", "/etc/passwd"))
            .unwrap();

        let mut scheduler = Scheduler::new();
        scheduler.run_before_tag(Tag::Files, |_, _: &mut OrderExecutor| {
            Err(vessel_common::VesselError::Internal {
                message: "staging failed".to_string(),
            })
        });

        let mut exec = OrderExecutor::default();
        assert!(scheduler.run(&mut registry, &mut exec).is_err());
        assert!(exec.order.is_empty());
    }

    #[test]
    fn identical_input_produces_identical_sequence() {
        let build = || {
            let mut registry = Registry::new();
            registry
                .add(Tag::Binds, MountPoint::bind("/b", "/mnt/b"))
                .unwrap();
            registry
                .add(Tag::Kernel, MountPoint::filesystem("proc", "/mnt/proc"))
                .unwrap();
            registry
                .add(Tag::Binds, MountPoint::bind("/a", "/mnt/a"))
                .unwrap();
            registry
        };

        let mut first = OrderExecutor::default();
        Scheduler::new().run(&mut build(), &mut first).unwrap();

        let mut second = OrderExecutor::default();
        Scheduler::new().run(&mut build(), &mut second).unwrap();

        assert_eq!(first.order, second.order);
        // Kernel precedes Binds; within Binds, submission order holds.
        assert_eq!(
            first.order,
            vec!["mount:/mnt/proc", "mount:/mnt/b", "mount:/mnt/a"]
        );
    }
}
