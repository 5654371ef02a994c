use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter, EnumString};

/// Tag identifying which payload decoder runs for a buffer.
///
/// The set is closed and versioned together with the kernel-side producers.
/// Tag 0 is reserved as invalid.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    EnumCount,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum EventKind {
    Open = 1,
    Mkdir = 2,
    Rmdir = 3,
    Unlink = 4,
    Rename = 5,
    Chmod = 6,
    Chown = 7,
    Utime = 8,
    Link = 9,
    Mount = 10,
    Umount = 11,
    #[strum(serialize = "setxattr")]
    #[serde(rename = "setxattr")]
    SetXattr = 12,
    #[strum(serialize = "removexattr")]
    #[serde(rename = "removexattr")]
    RemoveXattr = 13,
}

impl EventKind {
    /// Zero-based position used to index the per-type counters.
    pub(crate) fn ordinal(self) -> usize {
        self as usize - 1
    }
}

impl TryFrom<u32> for EventKind {
    type Error = u32;

    fn try_from(tag: u32) -> Result<Self, u32> {
        use EventKind::*;
        Ok(match tag {
            1 => Open,
            2 => Mkdir,
            3 => Rmdir,
            4 => Unlink,
            5 => Rename,
            6 => Chmod,
            7 => Chown,
            8 => Utime,
            9 => Link,
            10 => Mount,
            11 => Umount,
            12 => SetXattr,
            13 => RemoveXattr,
            _ => return Err(tag),
        })
    }
}

/// A single decoded kernel event.
///
/// A fresh instance is produced for every dispatched buffer, so concurrent
/// per-CPU callbacks never share decode state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub header: EventHeader,
    pub payload: Payload,
}

/// Shared metadata present in every event buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub kind: EventKind,
    pub timestamp: u64,
    pub pid: i32,
    pub tid: u32,
    pub retval: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum Payload {
    Open {
        filename: String,
        flags: u32,
        mode: u32,
        mount_id: u32,
    },
    Mkdir {
        dirname: String,
        mode: u32,
        mount_id: u32,
    },
    Rmdir {
        dirname: String,
        mount_id: u32,
    },
    Unlink {
        filename: String,
        mount_id: u32,
    },
    Rename {
        source: String,
        destination: String,
        mount_id: u32,
    },
    Chmod {
        filename: String,
        mode: u32,
        mount_id: u32,
    },
    Chown {
        filename: String,
        uid: u32,
        gid: u32,
        mount_id: u32,
    },
    Utime {
        filename: String,
        atime: u64,
        mtime: u64,
        mount_id: u32,
    },
    Link {
        source: String,
        destination: String,
        mount_id: u32,
    },
    Mount(MountRecord),
    Umount {
        mount_id: u32,
    },
    SetXattr {
        filename: String,
        name: String,
        mount_id: u32,
    },
    RemoveXattr {
        filename: String,
        name: String,
        mount_id: u32,
    },
}

/// Raw mount payload as decoded off the wire. The mount point is relative to
/// the parent mount; [`crate::resolvers::mount::MountResolver::resolve`]
/// turns it into an absolute [`crate::resolvers::mount::MountEntry`] before
/// it is inserted in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub mount_id: u32,
    pub parent_mount_id: u32,
    pub device: u32,
    pub fs_type: String,
    pub mount_point: String,
    pub root: String,
}

impl Payload {
    /// Event type of this payload. The match is exhaustive so the codec, the
    /// dispatcher and the per-type counters can never disagree on the tag.
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::Open { .. } => EventKind::Open,
            Payload::Mkdir { .. } => EventKind::Mkdir,
            Payload::Rmdir { .. } => EventKind::Rmdir,
            Payload::Unlink { .. } => EventKind::Unlink,
            Payload::Rename { .. } => EventKind::Rename,
            Payload::Chmod { .. } => EventKind::Chmod,
            Payload::Chown { .. } => EventKind::Chown,
            Payload::Utime { .. } => EventKind::Utime,
            Payload::Link { .. } => EventKind::Link,
            Payload::Mount(_) => EventKind::Mount,
            Payload::Umount { .. } => EventKind::Umount,
            Payload::SetXattr { .. } => EventKind::SetXattr,
            Payload::RemoveXattr { .. } => EventKind::RemoveXattr,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn kind_names_round_trip() {
        use strum::IntoEnumIterator;
        for kind in EventKind::iter() {
            assert_eq!(EventKind::from_str(&kind.to_string()), Ok(kind));
        }
        // these two don't follow the snake_case convention
        assert_eq!(EventKind::SetXattr.to_string(), "setxattr");
        assert_eq!(EventKind::RemoveXattr.to_string(), "removexattr");
    }

    #[test]
    fn tag_mapping_is_closed() {
        use strum::IntoEnumIterator;
        for kind in EventKind::iter() {
            assert_eq!(EventKind::try_from(kind as u32), Ok(kind));
        }
        assert_eq!(EventKind::try_from(0), Err(0));
        assert_eq!(EventKind::try_from(99), Err(99));
    }
}
