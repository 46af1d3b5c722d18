//! Fakeroot UID/GID mappings.
//!
//! Fakeroot simulates root inside the container by mapping the user
//! onto container UID 0 and a subordinate ID range onto the rest of
//! the container's ID space. The ranges come from the standard
//! subordinate-ID allocation files.

use std::path::Path;

use vessel_common::{VesselError, VesselResult};

use crate::namespace::IdMapping;

/// Standard subordinate UID allocation file.
pub const SUBUID_PATH: &str = "/etc/subuid";
/// Standard subordinate GID allocation file.
pub const SUBGID_PATH: &str = "/etc/subgid";

/// One subordinate ID range from /etc/subuid or /etc/subgid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubIdRange {
    /// First host ID of the range.
    pub start: u32,
    /// Number of IDs in the range.
    pub count: u32,
}

/// Find the subordinate range allocated to `user` in an allocation
/// file's contents. Entries may name the user or their numeric ID.
fn parse_range(content: &str, user: &str, id: u32) -> Option<SubIdRange> {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split(':');
        let owner = fields.next()?;
        if owner != user && owner != id.to_string() {
            continue;
        }

        let start = fields.next()?.parse().ok()?;
        let count = fields.next()?.parse().ok()?;
        return Some(SubIdRange { start, count });
    }
    None
}

/// Read the subordinate range for `user` from an allocation file.
pub fn read_range(path: &Path, user: &str, id: u32) -> VesselResult<SubIdRange> {
    let content = std::fs::read_to_string(path).map_err(|e| VesselError::Privilege {
        message: format!("cannot read {}: {e}", path.display()),
    })?;

    parse_range(&content, user, id).ok_or_else(|| VesselError::Privilege {
        message: format!(
            "no subordinate ID range for user {user} in {}",
            path.display()
        ),
    })
}

/// Build the fakeroot mappings for one ID space.
///
/// Container ID 0 maps to the user's own ID; container IDs from 1 map
/// onto the subordinate range. Absence of a range is a privilege
/// error, never downgraded.
pub fn fakeroot_mappings(own_id: u32, range: SubIdRange) -> Vec<IdMapping> {
    vec![
        IdMapping {
            container_id: 0,
            host_id: own_id,
            size: 1,
        },
        IdMapping {
            container_id: 1,
            host_id: range.start,
            size: range.count,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBUID: &str = "\
# comment
alice:100000:65536
bob:165536:65536
1002:231072:65536
";

    #[test]
    fn range_by_user_name() {
        let range = parse_range(SUBUID, "bob", 1001).unwrap();
        assert_eq!(
            range,
            SubIdRange {
                start: 165_536,
                count: 65536
            }
        );
    }

    #[test]
    fn range_by_numeric_id() {
        let range = parse_range(SUBUID, "carol", 1002).unwrap();
        assert_eq!(range.start, 231_072);
    }

    #[test]
    fn missing_range_is_a_privilege_error() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), SUBUID).unwrap();

        let err = read_range(temp.path(), "mallory", 666).unwrap_err();
        assert!(matches!(err, VesselError::Privilege { .. }));
    }

    #[test]
    fn fakeroot_maps_user_to_container_root() {
        let mappings = fakeroot_mappings(
            1000,
            SubIdRange {
                start: 100_000,
                count: 65536,
            },
        );
        assert_eq!(mappings[0].container_id, 0);
        assert_eq!(mappings[0].host_id, 1000);
        assert_eq!(mappings[0].size, 1);
        assert_eq!(mappings[1].container_id, 1);
        assert_eq!(mappings[1].host_id, 100_000);
        assert_eq!(mappings[1].size, 65536);
    }
}
