//! Open flags and seek origins carried in request envelopes.

use bitflags::bitflags;

bitflags! {
    /// Flags accepted by the Open operation and retained per connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Create the final path segment if it does not exist.
        const CREATE = 1 << 0;
        /// Combined with `CREATE`: fail with `AlreadyExists` instead of
        /// falling back to lookup.
        const EXCLUSIVE = 1 << 1;
        /// Truncate the node to zero length after a successful open.
        const TRUNCATE = 1 << 2;
        /// Writes always seek to end-of-file first.
        const APPEND = 1 << 3;
        /// The caller expects a directory; device proxying is suppressed.
        const DIRECTORY = 1 << 4;
        /// Suppress the post-lookup mount hand-off, resolving the mount
        /// point node itself instead of the mounted filesystem.
        const NO_REMOTE = 1 << 5;
        /// Pipelined open: the caller assumes success and will not read a
        /// description reply. Invalid when auxiliary handles must be
        /// returned.
        const PIPELINE = 1 << 6;
    }
}

impl OpenFlags {
    /// Decode flags from the signed wire argument, rejecting unknown bits.
    pub fn from_wire(arg: i32) -> Option<Self> {
        #[allow(clippy::cast_sign_loss)]
        Self::from_bits(arg as u32)
    }

    /// Encode flags into the signed wire argument.
    pub fn to_wire(self) -> i32 {
        #[allow(clippy::cast_possible_wrap)]
        {
            self.bits() as i32
        }
    }
}

/// Origin for the Seek operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    /// Relative to offset zero.
    Start,
    /// Relative to the connection's current offset.
    Current,
    /// Relative to the node's current size.
    End,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let flags = OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::PIPELINE;
        assert_eq!(OpenFlags::from_wire(flags.to_wire()), Some(flags));
    }

    #[test]
    fn unknown_bits_rejected() {
        assert_eq!(OpenFlags::from_wire(1 << 20), None);
        assert_eq!(OpenFlags::from_wire(-1), None);
    }
}
