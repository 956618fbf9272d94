//! Fixed-size records carried in message payloads.
//!
//! Attribute records, directory entries, and the mmap request record are
//! encoded little-endian with explicit layouts, so the payload bytes mean
//! the same thing on both sides of a channel regardless of which crate
//! produced them.

use crate::error::VfsError;

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Device front-end.
    Device,
}

impl NodeKind {
    fn to_byte(self) -> u8 {
        match self {
            NodeKind::File => 0,
            NodeKind::Directory => 1,
            NodeKind::Device => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self, VfsError> {
        match b {
            0 => Ok(NodeKind::File),
            1 => Ok(NodeKind::Directory),
            2 => Ok(NodeKind::Device),
            _ => Err(VfsError::Io),
        }
    }
}

/// Mode bit marking a node (or a create request) as a directory.
pub const MODE_DIR: u32 = 0o040_000;

/// Encoded size of a [`NodeAttr`] record.
pub const ATTR_SIZE: usize = 36;

/// The fixed-size attribute record exchanged by Stat/Setattr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    /// What the node is.
    pub kind: NodeKind,
    /// Permission bits (backend-defined).
    pub mode: u32,
    /// Hard-link count.
    pub nlink: u32,
    /// Content length in bytes.
    pub size: u64,
    /// Creation time, nanoseconds since the epoch.
    pub create_time: u64,
    /// Modification time, nanoseconds since the epoch.
    pub modify_time: u64,
}

impl NodeAttr {
    /// A zeroed record for a node of the given kind.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            mode: 0,
            nlink: 1,
            size: 0,
            create_time: 0,
            modify_time: 0,
        }
    }

    /// Encode into the fixed wire layout.
    pub fn to_bytes(&self) -> [u8; ATTR_SIZE] {
        let mut buf = [0u8; ATTR_SIZE];
        buf[0] = self.kind.to_byte();
        // bytes 1..4 reserved
        buf[4..8].copy_from_slice(&self.mode.to_le_bytes());
        buf[8..12].copy_from_slice(&self.nlink.to_le_bytes());
        buf[12..20].copy_from_slice(&self.size.to_le_bytes());
        buf[20..28].copy_from_slice(&self.create_time.to_le_bytes());
        buf[28..36].copy_from_slice(&self.modify_time.to_le_bytes());
        buf
    }

    /// Decode from the fixed wire layout, rejecting wrong-sized buffers.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, VfsError> {
        if buf.len() != ATTR_SIZE {
            return Err(VfsError::InvalidArgument);
        }
        Ok(Self {
            kind: NodeKind::from_byte(buf[0])?,
            mode: u32::from_le_bytes(buf[4..8].try_into().expect("checked length")),
            nlink: u32::from_le_bytes(buf[8..12].try_into().expect("checked length")),
            size: u64::from_le_bytes(buf[12..20].try_into().expect("checked length")),
            create_time: u64::from_le_bytes(buf[20..28].try_into().expect("checked length")),
            modify_time: u64::from_le_bytes(buf[28..36].try_into().expect("checked length")),
        })
    }
}

/// Per-entry header: u32 record length + u8 kind.
const DIRENT_HEADER: usize = 5;

/// Append one directory entry to `buf` if it fits within `max_bytes`.
///
/// Returns `false` (leaving `buf` untouched) when the entry does not fit;
/// the backend stops filling and reports the bytes written so far.
pub fn write_dirent(buf: &mut Vec<u8>, max_bytes: usize, name: &str, kind: NodeKind) -> bool {
    let reclen = DIRENT_HEADER + name.len();
    if buf.len() + reclen > max_bytes {
        return false;
    }
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(reclen as u32).to_le_bytes());
    buf.push(kind.to_byte());
    buf.extend_from_slice(name.as_bytes());
    true
}

/// One parsed directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    /// Entry name.
    pub name: String,
    /// Entry kind.
    pub kind: NodeKind,
}

/// Parse a readdir payload back into entries.
pub fn parse_dirents(mut buf: &[u8]) -> Result<Vec<Dirent>, VfsError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        if buf.len() < DIRENT_HEADER {
            return Err(VfsError::Io);
        }
        let reclen = u32::from_le_bytes(buf[0..4].try_into().expect("checked length")) as usize;
        if reclen < DIRENT_HEADER || reclen > buf.len() {
            return Err(VfsError::Io);
        }
        let kind = NodeKind::from_byte(buf[4])?;
        let name = std::str::from_utf8(&buf[DIRENT_HEADER..reclen])
            .map_err(|_| VfsError::Io)?
            .to_string();
        out.push(Dirent { name, kind });
        buf = &buf[reclen..];
    }
    Ok(out)
}

/// Encoded size of a [`MmapRequest`] record.
pub const MMAP_REQ_SIZE: usize = 20;

/// The fixed-size request record for the Mmap operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapRequest {
    /// Protection/mapping flags (backend-defined).
    pub flags: u32,
    /// Length of the mapping.
    pub len: u64,
    /// Offset into the node's contents.
    pub offset: u64,
}

impl MmapRequest {
    /// Encode into the fixed wire layout.
    pub fn to_bytes(&self) -> [u8; MMAP_REQ_SIZE] {
        let mut buf = [0u8; MMAP_REQ_SIZE];
        buf[0..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..12].copy_from_slice(&self.len.to_le_bytes());
        buf[12..20].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    /// Decode from the fixed wire layout, rejecting wrong-sized buffers.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, VfsError> {
        if buf.len() != MMAP_REQ_SIZE {
            return Err(VfsError::InvalidArgument);
        }
        Ok(Self {
            flags: u32::from_le_bytes(buf[0..4].try_into().expect("checked length")),
            len: u64::from_le_bytes(buf[4..12].try_into().expect("checked length")),
            offset: u64::from_le_bytes(buf[12..20].try_into().expect("checked length")),
        })
    }
}
