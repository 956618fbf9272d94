//! Path-segment normalization.

use riofs_proto::{MAX_NAME_LEN, VfsError, VfsResult};

/// A trimmed path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimmedName<'a> {
    /// The segment with trailing separators removed.
    pub name: &'a str,
    /// Whether any trailing separator was stripped, flagging "must be a
    /// directory" intent.
    pub must_be_dir: bool,
}

/// Strip trailing `/` characters from a path segment.
///
/// Fails `InvalidArgument` when nothing remains (empty or all-separator
/// input) and `NameTooLong` when the trimmed segment exceeds
/// [`MAX_NAME_LEN`].
pub fn trim_name(name: &str) -> VfsResult<TrimmedName<'_>> {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(VfsError::InvalidArgument);
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(VfsError::NameTooLong);
    }
    Ok(TrimmedName {
        name: trimmed,
        must_be_dir: trimmed.len() != name.len(),
    })
}
