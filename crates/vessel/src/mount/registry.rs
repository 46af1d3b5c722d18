//! The ordered mount point registry.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use vessel_common::{VesselError, VesselResult};

use super::{MountPoint, Tag};

/// Executes one concrete mount operation.
///
/// The production implementation is the privileged operation channel;
/// tests substitute a recording executor.
pub trait MountExecutor {
    /// Perform the mount described by `point`.
    fn mount(&mut self, point: &MountPoint) -> VesselResult<()>;
}

/// Ordered collection of pending mount operations.
///
/// Destinations are unique across the whole registry, independent of
/// tag; a second submission for the same destination is rejected before
/// any privileged call is issued, unless the newcomer is a remount pass
/// over the existing mount.
#[derive(Default)]
pub struct Registry {
    points: BTreeMap<Tag, Vec<MountPoint>>,
    destinations: HashSet<PathBuf>,
    skipped: HashSet<PathBuf>,
    applied: Vec<PathBuf>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a mount point under a tag.
    pub fn add(&mut self, tag: Tag, point: MountPoint) -> VesselResult<()> {
        if self.destinations.contains(&point.destination) && !point.flags.remount {
            return Err(VesselError::DuplicateMount {
                destination: point.destination.clone(),
            });
        }

        tracing::debug!(
            %tag,
            destination = %point.destination.display(),
            "Registered mount point"
        );

        self.destinations.insert(point.destination.clone());
        self.points.entry(tag).or_default().push(point);
        Ok(())
    }

    /// Drop all pending mount points under a tag.
    pub fn remove_by_tag(&mut self, tag: Tag) {
        if self.points.remove(&tag).is_some() {
            self.destinations = self
                .points
                .values()
                .flatten()
                .map(|p| p.destination.clone())
                .collect();
        }
    }

    /// Pending mount points under a tag, in submission order.
    #[must_use]
    pub fn by_tag(&self, tag: Tag) -> &[MountPoint] {
        self.points.get(&tag).map_or(&[], Vec::as_slice)
    }

    /// Look up a pending mount point by destination.
    #[must_use]
    pub fn by_destination(&self, destination: &std::path::Path) -> Option<&MountPoint> {
        self.points
            .values()
            .flatten()
            .find(|p| p.destination == destination)
    }

    /// Destinations applied so far, in apply order.
    #[must_use]
    pub fn applied(&self) -> &[PathBuf] {
        &self.applied
    }

    /// Destinations skipped so far.
    #[must_use]
    pub fn skipped(&self) -> &HashSet<PathBuf> {
        &self.skipped
    }

    /// Apply every pending mount point under `tag`, in submission order.
    ///
    /// Drains the tag. On a fatal error the remaining points of the tag
    /// are dropped and the applied list reflects exactly the prefix that
    /// succeeded, which cleanup unwinds in reverse.
    pub fn apply_tag(&mut self, tag: Tag, executor: &mut dyn MountExecutor) -> VesselResult<()> {
        let points = self.points.remove(&tag).unwrap_or_default();

        for point in points {
            if point.flags.remount && self.skipped.contains(&point.destination) {
                tracing::debug!(
                    destination = %point.destination.display(),
                    "Skipping remount of previously skipped mount"
                );
                continue;
            }

            match Self::mount_with_stale_retry(executor, &point) {
                Ok(()) => {
                    self.applied.push(point.destination.clone());
                }
                Err(e) if e.is_always_fatal() => {
                    // Transport failure outranks every per-mount policy.
                    return Err(e);
                }
                Err(e) if point.internal.skip_on_error => {
                    tracing::warn!(
                        destination = %point.destination.display(),
                        error = %e,
                        "Skipping best-effort mount"
                    );
                    self.skipped.insert(point.destination.clone());
                }
                Err(e)
                    if tag.tolerates_missing_destination()
                        && e.remote_errno() == Some(libc::ENOENT) =>
                {
                    tracing::warn!(
                        %tag,
                        destination = %point.destination.display(),
                        "Mount destination does not exist, skipping"
                    );
                    self.skipped.insert(point.destination.clone());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Mount, retrying overlay ESTALE once with `index=off`.
    ///
    /// Some kernels reject overlay mounts of lower directories that were
    /// exported over NFS with ESTALE unless the inode index is disabled.
    fn mount_with_stale_retry(
        executor: &mut dyn MountExecutor,
        point: &MountPoint,
    ) -> VesselResult<()> {
        match executor.mount(point) {
            Err(e) if point.is_overlay() && e.remote_errno() == Some(libc::ESTALE) => {
                tracing::warn!(
                    destination = %point.destination.display(),
                    "Overlay mount returned ESTALE, retrying with index=off"
                );
                let retry = point.clone().with_option("index=off");
                executor.mount(&retry)
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("pending", &self.points.values().map(Vec::len).sum::<usize>())
            .field("applied", &self.applied.len())
            .field("skipped", &self.skipped.len())
            .finish()
    }
}
