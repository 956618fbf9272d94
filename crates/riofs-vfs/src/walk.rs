//! Segment-by-segment path traversal over the node tree.

use riofs_proto::VfsResult;

use crate::node::NodeRef;

/// Where a walk stopped.
#[derive(Debug)]
pub(crate) enum WalkStep {
    /// Reached the final segment of a locally served path. `last` keeps any
    /// trailing separators for the name trimmer to interpret.
    Local {
        /// The directory owning the final segment.
        node: NodeRef,
        /// The final segment, untrimmed.
        last: String,
    },
    /// Crossed into a different server's authority. The remaining path is
    /// untouched; the caller waits for remote readiness and forwards.
    Remote {
        /// The mount point node.
        node: NodeRef,
        /// Path to forward, `"."` when nothing remains.
        remaining: String,
    },
}

/// Walk `path` starting at `start`.
///
/// Remote-ness is checked before the final-segment decision, so a mount
/// point that is also the last path segment still triggers hand-off.
/// Devices are excluded: they always present a remote channel for proxying
/// and must not be treated as mount points.
///
/// Must be called with the VFS tree lock held; never suspends beyond what
/// the backend's `lookup` does.
pub(crate) async fn walk(start: NodeRef, path: &str) -> VfsResult<WalkStep> {
    let mut node = start;
    let mut path = path;
    loop {
        path = path.trim_start_matches('/');
        if node.is_remote() && !node.is_device() {
            let remaining = if path.is_empty() { "." } else { path };
            return Ok(WalkStep::Remote {
                node,
                remaining: remaining.to_string(),
            });
        }
        if path.is_empty() {
            // A path of nothing but separators resolves to `.` on the
            // current node without descending.
            path = ".";
        }
        match path.split_once('/') {
            None => {
                return Ok(WalkStep::Local {
                    node,
                    last: path.to_string(),
                });
            }
            Some((_, rest)) if rest.trim_start_matches('/').is_empty() => {
                // Only trailing separators follow: this is the final
                // segment, and the trimmer turns the separators into
                // directory intent.
                return Ok(WalkStep::Local {
                    node,
                    last: path.to_string(),
                });
            }
            Some((segment, rest)) => {
                // A lookup failure propagates; the walk's intermediate
                // reference drops with `node`.
                node = node.backend().lookup(segment).await?;
                path = rest;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs;
    use riofs_proto::{Channel, VfsError};

    fn assert_local(step: WalkStep, last: &str) -> NodeRef {
        match step {
            WalkStep::Local { node, last: got } => {
                assert_eq!(got, last);
                node
            }
            WalkStep::Remote { .. } => panic!("expected local walk outcome"),
        }
    }

    #[tokio::test]
    async fn single_segment_stops_at_start() {
        let root = memfs::root();
        let step = walk(root.clone(), "foo").await.unwrap();
        let node = assert_local(step, "foo");
        assert!(std::sync::Arc::ptr_eq(&node, &root));
    }

    #[tokio::test]
    async fn descends_intermediate_segments() {
        let root = memfs::root();
        memfs::mkdir(&root, "a").unwrap();
        let a = memfs::resolve(&root, "a").unwrap();
        memfs::mkdir(&a, "b").unwrap();

        let step = walk(root, "/a/b/c").await.unwrap();
        let node = assert_local(step, "c");
        let b = memfs::resolve(&a, "b").unwrap();
        assert!(std::sync::Arc::ptr_eq(&node, &b));
    }

    #[tokio::test]
    async fn separator_only_path_is_dot() {
        let root = memfs::root();
        let step = walk(root, "///").await.unwrap();
        assert_local(step, ".");
    }

    #[tokio::test]
    async fn trailing_separators_stay_on_final_segment() {
        let root = memfs::root();
        let step = walk(root, "foo///").await.unwrap();
        assert_local(step, "foo///");
    }

    #[tokio::test]
    async fn mount_point_stops_walk_with_untouched_remainder() {
        let root = memfs::root();
        memfs::mkdir(&root, "a").unwrap();
        let a = memfs::resolve(&root, "a").unwrap();
        let (local, _server) = Channel::pair();
        a.attach_remote(local).unwrap();

        match walk(root, "/a/b/c").await.unwrap() {
            WalkStep::Remote { node, remaining } => {
                assert!(std::sync::Arc::ptr_eq(&node, &a));
                assert_eq!(remaining, "b/c");
            }
            WalkStep::Local { .. } => panic!("expected remote hand-off"),
        }
        a.detach_remote().unwrap();
    }

    #[tokio::test]
    async fn mount_point_as_last_segment_still_hands_off() {
        // Tie-break rule: remote-ness wins over final-segment detection for
        // any node the walk lands on.
        let root = memfs::root();
        memfs::mkdir(&root, "a").unwrap();
        let a = memfs::resolve(&root, "a").unwrap();
        memfs::mkdir(&a, "b").unwrap();
        let b = memfs::resolve(&a, "b").unwrap();
        let (local, _server) = Channel::pair();
        b.attach_remote(local).unwrap();

        match walk(root, "/a/b/c").await.unwrap() {
            WalkStep::Remote { node, remaining } => {
                assert!(std::sync::Arc::ptr_eq(&node, &b));
                assert_eq!(remaining, "c");
            }
            WalkStep::Local { .. } => panic!("expected remote hand-off"),
        }
        b.detach_remote().unwrap();
    }

    #[tokio::test]
    async fn lookup_miss_propagates() {
        let root = memfs::root();
        assert_eq!(
            walk(root, "missing/child").await.err(),
            Some(VfsError::NotFound)
        );
    }
}
