//! Schedule ordering properties.
//!
//! The concrete apply order must be a valid linear extension of the
//! tag partial order, deterministic across runs, and cleanup must
//! unwind exactly the applied prefix in reverse.

use std::path::PathBuf;

use proptest::prelude::*;
use vessel::mount::{MountExecutor, MountPoint, Registry, Scheduler, Tag};
use vessel_common::{VesselError, VesselResult};

#[derive(Default)]
struct RecordingExecutor {
    mounted: Vec<PathBuf>,
    fail_at: Option<PathBuf>,
}

impl MountExecutor for RecordingExecutor {
    fn mount(&mut self, point: &MountPoint) -> VesselResult<()> {
        if self.fail_at.as_deref() == Some(&point.destination) {
            return Err(VesselError::Remote {
                operation: "mount".to_string(),
                path: point.destination.clone(),
                errno: libc::EPERM,
            });
        }
        self.mounted.push(point.destination.clone());
        Ok(())
    }
}

fn tag_of(index: usize) -> Tag {
    Tag::ORDER[index % Tag::ORDER.len()]
}

fn build_registry(submissions: &[usize]) -> Registry {
    let mut registry = Registry::new();
    for (i, tag_index) in submissions.iter().enumerate() {
        registry
            .add(
                tag_of(*tag_index),
                MountPoint::bind(format!("/src/{i}"), format!("/mnt/{i}")),
            )
            .expect("destinations are unique by construction");
    }
    registry
}

proptest! {
    /// Applying any submission set yields a linear extension of the
    /// tag partial order, and repeated runs are identical.
    #[test]
    fn apply_order_is_a_deterministic_linear_extension(
        submissions in proptest::collection::vec(0usize..Tag::ORDER.len(), 0..40)
    ) {
        let run = || {
            let mut registry = build_registry(&submissions);
            let mut exec = RecordingExecutor::default();
            Scheduler::new().run(&mut registry, &mut exec).unwrap();
            exec.mounted
        };

        let first = run();
        let second = run();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), submissions.len());

        // Tags must be non-decreasing along the apply order, and
        // within one tag the submission order must be preserved.
        let order_of = |dest: &PathBuf| -> (usize, usize) {
            let i: usize = dest
                .to_string_lossy()
                .trim_start_matches("/mnt/")
                .parse()
                .unwrap();
            (submissions[i] % Tag::ORDER.len(), i)
        };

        for pair in first.windows(2) {
            let (tag_a, sub_a) = order_of(&pair[0]);
            let (tag_b, sub_b) = order_of(&pair[1]);
            prop_assert!(tag_a < tag_b || (tag_a == tag_b && sub_a < sub_b));
        }
    }

    /// A mount failure aborts the schedule leaving exactly the applied
    /// prefix behind, which unwinds in reverse order.
    #[test]
    fn failure_leaves_a_cleanly_unwindable_prefix(
        submissions in proptest::collection::vec(0usize..Tag::ORDER.len(), 1..40),
        fail_index in 0usize..40,
    ) {
        prop_assume!(fail_index < submissions.len());

        // Find what would be applied in a clean run, then fail at one
        // of those destinations.
        let mut registry = build_registry(&submissions);
        let mut clean = RecordingExecutor::default();
        Scheduler::new().run(&mut registry, &mut clean).unwrap();
        let fail_at = clean.mounted[fail_index].clone();

        let mut registry = build_registry(&submissions);
        let mut exec = RecordingExecutor {
            fail_at: Some(fail_at.clone()),
            ..RecordingExecutor::default()
        };
        let result = Scheduler::new().run(&mut registry, &mut exec);
        prop_assert!(result.is_err());

        // The applied list is exactly the prefix before the failure.
        prop_assert_eq!(registry.applied(), &clean.mounted[..fail_index]);

        // Reverse unwind visits every applied mount exactly once, in
        // inverse apply order.
        let unwind: Vec<_> = registry.applied().iter().rev().cloned().collect();
        let mut expected = registry.applied().to_vec();
        expected.reverse();
        prop_assert_eq!(unwind, expected);
    }
}

/// Best-effort host binds that fail are recorded as skipped and the
/// rest of the schedule continues.
#[test]
fn missing_host_files_skip_and_continue() {
    let mut registry = Registry::new();
    for path in ["/etc/hosts", "/etc/localtime"] {
        registry
            .add(
                Tag::Binds,
                MountPoint::bind(path, format!("/mnt{path}")).skip_on_error(),
            )
            .unwrap();
    }
    registry
        .add(Tag::Home, MountPoint::bind("/home/user", "/mnt/home/user"))
        .unwrap();

    struct MissingHostFiles {
        mounted: Vec<PathBuf>,
    }
    impl MountExecutor for MissingHostFiles {
        fn mount(&mut self, point: &MountPoint) -> VesselResult<()> {
            if point.destination.starts_with("/mnt/etc") {
                return Err(VesselError::Remote {
                    operation: "mount".to_string(),
                    path: point.destination.clone(),
                    errno: libc::ENOENT,
                });
            }
            self.mounted.push(point.destination.clone());
            Ok(())
        }
    }

    let mut exec = MissingHostFiles { mounted: Vec::new() };
    Scheduler::new().run(&mut registry, &mut exec).unwrap();

    assert!(registry.skipped().contains(&PathBuf::from("/mnt/etc/hosts")));
    assert!(registry
        .skipped()
        .contains(&PathBuf::from("/mnt/etc/localtime")));
    assert_eq!(exec.mounted, vec![PathBuf::from("/mnt/home/user")]);
}

#[test]
fn hooks_do_not_disturb_mount_ordering() {
    let mut registry = Registry::new();
    for (tag, dest) in [
        (Tag::Kernel, "/proc"),
        (Tag::Dev, "/dev"),
        (Tag::Binds, "/data"),
    ] {
        registry.add(tag, MountPoint::bind("/src", dest)).unwrap();
    }

    let mut scheduler: Scheduler<RecordingExecutor> = Scheduler::new();
    scheduler.run_before_tag(Tag::Dev, |_, _| Ok(()));
    scheduler.run_after_tag(Tag::Binds, |_, _| Ok(()));

    let mut exec = RecordingExecutor::default();
    scheduler.run(&mut registry, &mut exec).unwrap();

    assert_eq!(
        exec.mounted,
        vec![
            PathBuf::from("/proc"),
            PathBuf::from("/dev"),
            PathBuf::from("/data"),
        ]
    );
}
