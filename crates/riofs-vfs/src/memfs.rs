//! In-memory backend: directories and files living entirely in process
//! memory. The default tree a server starts from, and the backend the test
//! suites exercise the dispatcher against.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use riofs_proto::{
    Channel, Handle, MODE_DIR, Message, MmapRequest, NodeAttr, NodeKind, OpenFlags, Reply,
    VfsError, VfsResult, write_dirent,
};

use crate::node::{DirCookie, Node, NodeRef, Vnode};

/// Control operation on memfs files: reply with the input payload.
pub const IOCTL_ECHO: u32 = 0x0101;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_dir(node: &NodeRef) -> bool {
    node.backend().as_any().is::<MemDir>()
}

/// An in-memory directory.
#[derive(Default)]
pub struct MemDir {
    entries: Mutex<HashMap<String, NodeRef>>,
    watchers: Mutex<Vec<Channel>>,
}

impl MemDir {
    fn get(&self, name: &str) -> VfsResult<NodeRef> {
        lock(&self.entries)
            .get(name)
            .cloned()
            .ok_or(VfsError::NotFound)
    }

    fn insert_new(&self, name: &str, node: NodeRef) -> VfsResult<()> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(name) {
            return Err(VfsError::AlreadyExists);
        }
        entries.insert(name.to_string(), node);
        Ok(())
    }
}

#[async_trait]
impl Vnode for MemDir {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn lookup(&self, name: &str) -> VfsResult<NodeRef> {
        self.get(name)
    }

    async fn create(&self, name: &str, mode: u32) -> VfsResult<NodeRef> {
        let node = if mode & MODE_DIR != 0 {
            Node::new(Arc::new(MemDir::default()))
        } else {
            Node::new(Arc::new(MemFile::default()))
        };
        self.insert_new(name, Arc::clone(&node))?;
        Ok(node)
    }

    async fn getattr(&self) -> VfsResult<NodeAttr> {
        Ok(NodeAttr {
            kind: NodeKind::Directory,
            mode: MODE_DIR | 0o755,
            nlink: 1,
            size: 0,
            create_time: 0,
            modify_time: 0,
        })
    }

    async fn readdir(&self, cookie: &mut DirCookie, max_bytes: usize) -> VfsResult<Vec<u8>> {
        let mut names: Vec<(String, NodeKind)> = lock(&self.entries)
            .iter()
            .map(|(name, node)| {
                let kind = if is_dir(node) {
                    NodeKind::Directory
                } else {
                    NodeKind::File
                };
                (name.clone(), kind)
            })
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buf = Vec::new();
        #[allow(clippy::cast_possible_truncation)]
        for (name, kind) in names.into_iter().skip(cookie.0 as usize) {
            if !write_dirent(&mut buf, max_bytes, &name, kind) {
                break;
            }
            cookie.0 += 1;
        }
        Ok(buf)
    }

    async fn unlink(&self, name: &str, must_be_dir: bool) -> VfsResult<()> {
        let mut entries = lock(&self.entries);
        let node = entries.get(name).ok_or(VfsError::NotFound)?;
        if must_be_dir && !is_dir(node) {
            return Err(VfsError::NotADirectory);
        }
        entries.remove(name);
        Ok(())
    }

    async fn rename(
        &self,
        old_name: &str,
        new_parent: &NodeRef,
        new_name: &str,
        src_must_be_dir: bool,
        dst_must_be_dir: bool,
    ) -> VfsResult<()> {
        let dst = new_parent
            .backend()
            .as_any()
            .downcast_ref::<MemDir>()
            .ok_or(VfsError::NotSupported)?;
        let node = self.get(old_name)?;
        if (src_must_be_dir || dst_must_be_dir) && !is_dir(&node) {
            return Err(VfsError::NotADirectory);
        }
        if std::ptr::eq(self, dst) {
            let mut entries = lock(&self.entries);
            if old_name == new_name {
                return Ok(());
            }
            let node = entries.remove(old_name).ok_or(VfsError::NotFound)?;
            entries.insert(new_name.to_string(), node);
            return Ok(());
        }
        // Destination gains the entry before the source loses it, so a
        // concurrent walk never misses the node entirely.
        lock(&dst.entries).insert(new_name.to_string(), Arc::clone(&node));
        lock(&self.entries).remove(old_name);
        Ok(())
    }

    async fn link(&self, old_name: &str, new_parent: &NodeRef, new_name: &str) -> VfsResult<()> {
        let dst = new_parent
            .backend()
            .as_any()
            .downcast_ref::<MemDir>()
            .ok_or(VfsError::NotSupported)?;
        let node = self.get(old_name)?;
        if is_dir(&node) {
            return Err(VfsError::NotSupported);
        }
        dst.insert_new(new_name, node)
    }

    fn watch_dir(&self) -> VfsResult<Channel> {
        let (ours, theirs) = Channel::pair();
        lock(&self.watchers).push(ours);
        Ok(theirs)
    }

    fn notify_add(&self, name: &str) {
        let mut watchers = lock(&self.watchers);
        watchers.retain(|watcher| {
            watcher
                .send(Message::Reply(
                    Reply::ok().with_data(name.as_bytes().to_vec()),
                ))
                .is_ok()
        });
    }
}

#[derive(Debug, Clone, Copy)]
struct FileMeta {
    mode: u32,
    create_time: u64,
    modify_time: u64,
}

impl Default for FileMeta {
    fn default() -> Self {
        Self {
            mode: 0o644,
            create_time: 0,
            modify_time: 0,
        }
    }
}

/// An in-memory regular file.
#[derive(Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    meta: Mutex<FileMeta>,
}

#[async_trait]
impl Vnode for MemFile {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn open(&self, flags: OpenFlags) -> VfsResult<()> {
        if flags.contains(OpenFlags::DIRECTORY) {
            return Err(VfsError::NotADirectory);
        }
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: usize) -> VfsResult<Vec<u8>> {
        let data = lock(&self.data);
        let Ok(start) = usize::try_from(offset) else {
            return Ok(Vec::new());
        };
        if start >= data.len() {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write_at(&self, offset: u64, input: &[u8]) -> VfsResult<usize> {
        let start = usize::try_from(offset).map_err(|_| VfsError::InvalidArgument)?;
        let mut data = lock(&self.data);
        let end = start
            .checked_add(input.len())
            .ok_or(VfsError::InvalidArgument)?;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(input);
        Ok(input.len())
    }

    async fn truncate(&self, len: u64) -> VfsResult<()> {
        let len = usize::try_from(len).map_err(|_| VfsError::InvalidArgument)?;
        lock(&self.data).resize(len, 0);
        Ok(())
    }

    async fn getattr(&self) -> VfsResult<NodeAttr> {
        let meta = *lock(&self.meta);
        Ok(NodeAttr {
            kind: NodeKind::File,
            mode: meta.mode,
            nlink: 1,
            size: lock(&self.data).len() as u64,
            create_time: meta.create_time,
            modify_time: meta.modify_time,
        })
    }

    async fn setattr(&self, attr: NodeAttr) -> VfsResult<()> {
        let mut meta = lock(&self.meta);
        meta.mode = attr.mode;
        meta.create_time = attr.create_time;
        meta.modify_time = attr.modify_time;
        Ok(())
    }

    async fn ioctl(&self, op: u32, input: &[u8], max_reply: usize) -> VfsResult<Vec<u8>> {
        match op {
            IOCTL_ECHO => {
                if input.len() > max_reply {
                    return Err(VfsError::InvalidArgument);
                }
                Ok(input.to_vec())
            }
            _ => Err(VfsError::NotSupported),
        }
    }

    async fn sync(&self) -> VfsResult<()> {
        Ok(())
    }

    async fn mmap(&self, req: MmapRequest) -> VfsResult<Handle> {
        if req.len == 0 {
            return Err(VfsError::InvalidArgument);
        }
        let data = lock(&self.data);
        let start = usize::try_from(req.offset).map_err(|_| VfsError::InvalidArgument)?;
        if start > data.len() {
            return Err(VfsError::InvalidArgument);
        }
        let len = usize::try_from(req.len).unwrap_or(usize::MAX);
        let end = start.saturating_add(len).min(data.len());
        Ok(Handle::Buffer(Arc::from(&data[start..end])))
    }
}

/// An empty directory to serve as a tree root.
pub fn root() -> NodeRef {
    Node::new(Arc::new(MemDir::default()))
}

/// Create a subdirectory without going through the open path.
pub fn mkdir(parent: &NodeRef, name: &str) -> VfsResult<NodeRef> {
    let dir = as_dir(parent)?;
    let node = Node::new(Arc::new(MemDir::default()));
    dir.insert_new(name, Arc::clone(&node))?;
    Ok(node)
}

/// Create a file with initial contents without going through the open path.
pub fn put_file(parent: &NodeRef, name: &str, content: &[u8]) -> VfsResult<NodeRef> {
    let dir = as_dir(parent)?;
    let file = MemFile::default();
    *lock(&file.data) = content.to_vec();
    let node = Node::new(Arc::new(file));
    dir.insert_new(name, Arc::clone(&node))?;
    Ok(node)
}

/// Insert an arbitrary node (a device front-end, a custom backend) as a
/// directory entry.
pub fn put_node(parent: &NodeRef, name: &str, node: NodeRef) -> VfsResult<()> {
    as_dir(parent)?.insert_new(name, node)
}

/// Resolve a direct child by name without going through the open path.
pub fn resolve(parent: &NodeRef, name: &str) -> VfsResult<NodeRef> {
    as_dir(parent)?.get(name)
}

fn as_dir(node: &NodeRef) -> VfsResult<&MemDir> {
    node.backend()
        .as_any()
        .downcast_ref::<MemDir>()
        .ok_or(VfsError::NotADirectory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use riofs_proto::parse_dirents;

    #[tokio::test]
    async fn file_read_write_truncate() {
        let root = root();
        let file = put_file(&root, "f", b"hello world").unwrap();
        let backend = file.backend();

        assert_eq!(backend.read_at(6, 16).await.unwrap(), b"world");
        assert_eq!(backend.read_at(64, 4).await.unwrap(), b"");
        backend.write_at(6, b"there").await.unwrap();
        assert_eq!(backend.read_at(0, 64).await.unwrap(), b"hello there");

        backend.truncate(5).await.unwrap();
        assert_eq!(backend.getattr().await.unwrap().size, 5);
        // Extending truncate zero-fills.
        backend.truncate(7).await.unwrap();
        assert_eq!(backend.read_at(0, 64).await.unwrap(), b"hello\0\0");
    }

    #[tokio::test]
    async fn sparse_write_zero_fills() {
        let root = root();
        let file = put_file(&root, "f", b"").unwrap();
        file.backend().write_at(3, b"x").await.unwrap();
        assert_eq!(file.backend().read_at(0, 8).await.unwrap(), b"\0\0\0x");
    }

    #[tokio::test]
    async fn readdir_paginates_and_resumes() {
        let root = root();
        put_file(&root, "aaa", b"").unwrap();
        put_file(&root, "bbb", b"").unwrap();
        mkdir(&root, "ccc").unwrap();

        let mut cookie = DirCookie::default();
        // Budget fits one dirent (5-byte header + 3-byte name).
        let buf = root.backend().readdir(&mut cookie, 9).await.unwrap();
        let first = parse_dirents(&buf).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "aaa");

        let buf = root.backend().readdir(&mut cookie, 4096).await.unwrap();
        let rest = parse_dirents(&buf).unwrap();
        let names: Vec<_> = rest.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["bbb", "ccc"]);
        assert_eq!(rest[1].kind, NodeKind::Directory);

        cookie.reset();
        let buf = root.backend().readdir(&mut cookie, 4096).await.unwrap();
        assert_eq!(parse_dirents(&buf).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unlink_checks_directory_intent() {
        let root = root();
        put_file(&root, "f", b"").unwrap();
        assert_eq!(
            root.backend().unlink("f", true).await,
            Err(VfsError::NotADirectory)
        );
        root.backend().unlink("f", false).await.unwrap();
        assert_eq!(
            root.backend().unlink("f", false).await,
            Err(VfsError::NotFound)
        );
    }

    #[tokio::test]
    async fn rename_across_directories() {
        let root = root();
        let src = mkdir(&root, "src").unwrap();
        let dst = mkdir(&root, "dst").unwrap();
        let file = put_file(&src, "f", b"x").unwrap();

        src.backend()
            .rename("f", &dst, "g", false, false)
            .await
            .unwrap();
        assert!(resolve(&src, "f").is_err());
        let moved = resolve(&dst, "g").unwrap();
        assert!(Arc::ptr_eq(&moved, &file));
    }

    #[tokio::test]
    async fn rename_directory_intent_on_file_rejected() {
        let root = root();
        put_file(&root, "f", b"").unwrap();
        assert_eq!(
            root.backend().rename("f", &root, "g", true, false).await,
            Err(VfsError::NotADirectory)
        );
    }

    #[tokio::test]
    async fn link_shares_the_node() {
        let root = root();
        let file = put_file(&root, "f", b"x").unwrap();
        root.backend().link("f", &root, "g").await.unwrap();
        let linked = resolve(&root, "g").unwrap();
        assert!(Arc::ptr_eq(&linked, &file));

        assert_eq!(
            root.backend().link("f", &root, "g").await,
            Err(VfsError::AlreadyExists)
        );
        let sub = mkdir(&root, "d").unwrap();
        assert_eq!(
            root.backend().link("d", &root, "d2").await,
            Err(VfsError::NotSupported)
        );
        drop(sub);
    }

    #[tokio::test]
    async fn watch_sees_notify_add() {
        let root = root();
        let watch = root.backend().watch_dir().unwrap();
        root.backend().notify_add("newfile");
        let Some(Message::Reply(reply)) = watch.recv().await else {
            panic!("expected watch notification");
        };
        assert_eq!(reply.data, b"newfile");
    }

    #[tokio::test]
    async fn mmap_snapshots_a_range() {
        let root = root();
        let file = put_file(&root, "f", b"abcdef").unwrap();
        let req = MmapRequest {
            flags: 0,
            len: 4,
            offset: 2,
        };
        let Handle::Buffer(buf) = file.backend().mmap(req).await.unwrap() else {
            panic!("expected buffer handle");
        };
        assert_eq!(&*buf, b"cdef");
    }

    #[tokio::test]
    async fn echo_ioctl_bounded_by_reply_limit() {
        let root = root();
        let file = put_file(&root, "f", b"").unwrap();
        assert_eq!(
            file.backend().ioctl(IOCTL_ECHO, b"ping", 64).await.unwrap(),
            b"ping"
        );
        assert_eq!(
            file.backend().ioctl(IOCTL_ECHO, b"ping", 2).await,
            Err(VfsError::InvalidArgument)
        );
        assert_eq!(
            file.backend().ioctl(0xdead, b"", 0).await,
            Err(VfsError::NotSupported)
        );
    }
}
