//! Cache of active mount points, mutated by mount/umount events and
//! consulted to resolve paths of later events referencing a mount id.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, prelude::*, BufReader},
    sync::Mutex,
};

use thiserror::Error;

use crate::event::MountRecord;

static MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MountError {
    #[error("mount {0} not found")]
    NotFound(u32),
    #[error("mount point resolution loop for mount {mount_id}")]
    ResolutionLoop { mount_id: u32 },
}

#[derive(Error, Debug)]
pub enum MountinfoError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },
}

/// A fully resolved cache entry.
///
/// `mount_point` is absolute: it is resolved through the parent chain by
/// [`MountResolver::resolve`] before the entry is inserted, so lookups by
/// later events always observe a consistent path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_id: u32,
    pub parent_id: u32,
    pub device: u32,
    pub fs_type: String,
    pub mount_point: String,
    pub root: String,
}

/// Mount cache guarded by a single mutex: mount churn is low relative to
/// the rest of the event volume, so no sharding is needed. All methods take
/// the lock once and never call back into the resolver, which keeps
/// concurrent inserts/lookups from different CPU callbacks deadlock-free.
#[derive(Default)]
pub struct MountResolver {
    entries: Mutex<HashMap<u32, MountEntry>>,
}

impl MountResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional upsert: a new entry for an existing id overwrites it.
    pub fn insert(&self, entry: MountEntry) {
        self.entries.lock().unwrap().insert(entry.mount_id, entry);
    }

    pub fn lookup(&self, mount_id: u32) -> Option<MountEntry> {
        self.entries.lock().unwrap().get(&mount_id).cloned()
    }

    /// Remove the entry for `mount_id`. Deleting an unknown id is reported
    /// as [`MountError::NotFound`] so the caller can decide whether to log;
    /// the cache is left untouched.
    pub fn delete(&self, mount_id: u32) -> Result<(), MountError> {
        match self.entries.lock().unwrap().remove(&mount_id) {
            Some(_) => Ok(()),
            None => Err(MountError::NotFound(mount_id)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a raw mount record into a cache entry with an absolute mount
    /// point.
    ///
    /// Entries are resolved before insertion, so the parent chain collapses
    /// into a single lookup: the parent's `mount_point` is already the full
    /// path computed from its own ancestors. A record naming itself as
    /// parent fails with [`MountError::ResolutionLoop`]; a missing parent
    /// fails with [`MountError::NotFound`].
    pub fn resolve(&self, record: &MountRecord) -> Result<MountEntry, MountError> {
        let mut mount_point = record.mount_point.clone();
        if record.parent_mount_id != 0 {
            if record.parent_mount_id == record.mount_id {
                return Err(MountError::ResolutionLoop {
                    mount_id: record.mount_id,
                });
            }
            let entries = self.entries.lock().unwrap();
            let parent = entries
                .get(&record.parent_mount_id)
                .ok_or(MountError::NotFound(record.parent_mount_id))?;
            mount_point = join_path(&parent.mount_point, &mount_point);
        }
        Ok(MountEntry {
            mount_id: record.mount_id,
            parent_id: record.parent_mount_id,
            device: record.device,
            fs_type: record.fs_type.clone(),
            mount_point,
            root: record.root.clone(),
        })
    }

    /// Absolute path of `relative_path` interpreted under the given mount.
    /// Read path used while interpreting events referencing a mount id.
    pub fn resolve_path(&self, mount_id: u32, relative_path: &str) -> Option<String> {
        let entry = self.lookup(mount_id)?;
        Some(join_path(&entry.mount_point, relative_path))
    }

    /// Seed the cache from a `/proc/<pid>/mountinfo`-format reader.
    ///
    /// Each line looks like:
    ///
    /// ```ignore
    /// 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
    /// (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
    /// ```
    ///
    /// We use fields 1 (mount id), 2 (parent id), 3 (device), 4 (root),
    /// 5 (mount point, already absolute) and 9 (filesystem type).
    /// Malformed lines are skipped.
    pub fn sync_with_mountinfo<R: Read>(&self, reader: BufReader<R>) -> usize {
        let mut seeded = 0;
        for line in reader.lines().map_while(Result::ok) {
            let Some((mount_info, filesystem_info)) = line.split_once(" - ") else {
                continue;
            };
            let mount_parts: Vec<&str> = mount_info.split_whitespace().collect();
            let filesystem_parts: Vec<&str> = filesystem_info.split_whitespace().collect();
            if mount_parts.len() < 5 || filesystem_parts.is_empty() {
                continue;
            }
            let (Ok(mount_id), Ok(parent_id)) =
                (mount_parts[0].parse::<u32>(), mount_parts[1].parse::<u32>())
            else {
                continue;
            };
            let Some(device) = parse_device(mount_parts[2]) else {
                continue;
            };
            self.insert(MountEntry {
                mount_id,
                parent_id,
                device,
                fs_type: filesystem_parts[0].to_string(),
                mount_point: mount_parts[4].to_string(),
                root: mount_parts[3].to_string(),
            });
            seeded += 1;
        }
        seeded
    }

    /// Seed the cache with the mounts currently visible to this process.
    pub fn sync_with_proc(&self) -> Result<usize, MountinfoError> {
        let file = File::open(MOUNTINFO_PATH).map_err(|source| MountinfoError::ReadFile {
            source,
            path: MOUNTINFO_PATH.to_owned(),
        })?;
        Ok(self.sync_with_mountinfo(BufReader::new(file)))
    }
}

fn join_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    if child.is_empty() {
        if parent.is_empty() {
            return "/".to_string();
        }
        return parent.to_string();
    }
    format!("{parent}/{child}")
}

fn parse_device(device: &str) -> Option<u32> {
    let (major, minor) = device.split_once(':')?;
    let major: u32 = major.parse().ok()?;
    let minor: u32 = minor.parse().ok()?;
    Some((major << 20) | minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mount_id: u32, parent_id: u32, mount_point: &str) -> MountEntry {
        MountEntry {
            mount_id,
            parent_id,
            device: 0,
            fs_type: "ext4".to_string(),
            mount_point: mount_point.to_string(),
            root: "/".to_string(),
        }
    }

    #[test]
    fn insert_lookup_delete() {
        let resolver = MountResolver::new();
        resolver.insert(entry(7, 0, "/mnt/a"));
        assert_eq!(resolver.lookup(7), Some(entry(7, 0, "/mnt/a")));
        assert_eq!(resolver.delete(7), Ok(()));
        assert_eq!(resolver.lookup(7), None);
    }

    #[test]
    fn delete_unknown_id_reports_not_found() {
        let resolver = MountResolver::new();
        assert_eq!(resolver.delete(99), Err(MountError::NotFound(99)));
        assert_eq!(resolver.len(), 0);
    }

    #[test]
    fn insert_overwrites_existing_entry() {
        let resolver = MountResolver::new();
        resolver.insert(entry(7, 0, "/mnt/a"));
        resolver.insert(entry(7, 0, "/mnt/b"));
        assert_eq!(resolver.len(), 1);
        assert_eq!(resolver.lookup(7).unwrap().mount_point, "/mnt/b");
    }

    #[test]
    fn resolve_through_parent_chain() {
        let resolver = MountResolver::new();
        resolver.insert(entry(1, 0, "/"));

        let data = resolver
            .resolve(&MountRecord {
                mount_id: 2,
                parent_mount_id: 1,
                device: 42,
                fs_type: "ext4".to_string(),
                mount_point: "data".to_string(),
                root: "/".to_string(),
            })
            .unwrap();
        assert_eq!(data.mount_point, "/data");
        resolver.insert(data);

        // the grandchild sees the already-resolved parent path
        let logs = resolver
            .resolve(&MountRecord {
                mount_id: 3,
                parent_mount_id: 2,
                device: 43,
                fs_type: "tmpfs".to_string(),
                mount_point: "logs".to_string(),
                root: "/".to_string(),
            })
            .unwrap();
        assert_eq!(logs.mount_point, "/data/logs");
    }

    #[test]
    fn resolve_missing_parent() {
        let resolver = MountResolver::new();
        let err = resolver
            .resolve(&MountRecord {
                mount_id: 2,
                parent_mount_id: 5,
                device: 0,
                fs_type: "ext4".to_string(),
                mount_point: "data".to_string(),
                root: "/".to_string(),
            })
            .unwrap_err();
        assert_eq!(err, MountError::NotFound(5));
    }

    #[test]
    fn resolve_self_parent_loop() {
        let resolver = MountResolver::new();
        let err = resolver
            .resolve(&MountRecord {
                mount_id: 2,
                parent_mount_id: 2,
                device: 0,
                fs_type: "ext4".to_string(),
                mount_point: "data".to_string(),
                root: "/".to_string(),
            })
            .unwrap_err();
        assert_eq!(err, MountError::ResolutionLoop { mount_id: 2 });
    }

    #[test]
    fn resolve_path_under_mount() {
        let resolver = MountResolver::new();
        resolver.insert(entry(3, 0, "/data"));
        assert_eq!(
            resolver.resolve_path(3, "logs/app.log"),
            Some("/data/logs/app.log".to_string())
        );
        assert_eq!(resolver.resolve_path(4, "logs/app.log"), None);
    }

    #[test]
    fn sync_from_mountinfo() {
        let mountinfo = b"24 31 0:22 / /proc rw,nosuid,nodev,noexec,relatime - proc proc rw
25 31 0:23 / /sys rw,nosuid,nodev,noexec,relatime - sysfs sysfs rw
31 1 0:27 / / rw,relatime - btrfs /dev/mapper/root rw,ssd
53 31 259:4 / /boot rw,relatime - vfat /dev/nvme1n1p1 rw
garbage line without separator
62 25 0:69 / /sys/fs/bpf rw,relatime - bpf bpf rw";

        let resolver = MountResolver::new();
        let seeded = resolver.sync_with_mountinfo(BufReader::new(&mountinfo[..]));
        assert_eq!(seeded, 5);
        let boot = resolver.lookup(53).unwrap();
        assert_eq!(boot.mount_point, "/boot");
        assert_eq!(boot.fs_type, "vfat");
        assert_eq!(boot.parent_id, 31);
    }
}
