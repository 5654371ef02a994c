//! Binary codec for the event buffers produced by the kernel probes.
//!
//! A buffer starts with a fixed-size common header followed by a
//! type-specific payload, consumed positionally. Variant decoders validate
//! the remaining length before every read: a truncated or malformed buffer
//! fails with a [`DecodeError`], it never reads out of bounds.
//!
//! All integers are little-endian; strings are u16-length-prefixed UTF-8.

use thiserror::Error;

use crate::event::{Event, EventHeader, EventKind, MountRecord, Payload};

/// Size of the common event header.
pub const HEADER_LEN: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported event type {0}")]
    UnsupportedType(u32),
    #[error("truncated event: needed {expected} bytes at offset {offset}, buffer is {len}")]
    Truncated {
        offset: usize,
        expected: usize,
        len: usize,
    },
    #[error("string field at offset {offset} is not valid utf-8")]
    NotAString { offset: usize },
}

/// Bounds-checked positional reader over a raw event buffer.
struct RawReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> RawReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.offset < n {
            return Err(DecodeError::Truncated {
                offset: self.offset,
                expected: n,
                len: self.buf.len(),
            });
        }
        let slice = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.u64()? as i64)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let start = self.offset;
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::NotAString { offset: start })
    }
}

/// Decode one event buffer, returning the typed event and the number of
/// bytes consumed.
///
/// The header's tag selects exactly one variant decoder; an unrecognized tag
/// fails with [`DecodeError::UnsupportedType`] before any payload byte is
/// read. Decoding has no side effects: cache mutation belongs to the
/// dispatcher.
pub fn decode(buffer: &[u8]) -> Result<(Event, usize), DecodeError> {
    let mut r = RawReader::new(buffer);

    let tag = r.u32()?;
    let _pad = r.u32()?;
    let timestamp = r.u64()?;
    let pid = r.u32()? as i32;
    let tid = r.u32()?;
    let retval = r.i64()?;

    let kind = EventKind::try_from(tag).map_err(DecodeError::UnsupportedType)?;
    let payload = match kind {
        EventKind::Open => {
            let mount_id = r.u32()?;
            let flags = r.u32()?;
            let mode = r.u32()?;
            let filename = r.string()?;
            Payload::Open {
                filename,
                flags,
                mode,
                mount_id,
            }
        }
        EventKind::Mkdir => {
            let mount_id = r.u32()?;
            let mode = r.u32()?;
            let dirname = r.string()?;
            Payload::Mkdir {
                dirname,
                mode,
                mount_id,
            }
        }
        EventKind::Rmdir => {
            let mount_id = r.u32()?;
            let dirname = r.string()?;
            Payload::Rmdir { dirname, mount_id }
        }
        EventKind::Unlink => {
            let mount_id = r.u32()?;
            let filename = r.string()?;
            Payload::Unlink { filename, mount_id }
        }
        EventKind::Rename => {
            let mount_id = r.u32()?;
            let source = r.string()?;
            let destination = r.string()?;
            Payload::Rename {
                source,
                destination,
                mount_id,
            }
        }
        EventKind::Chmod => {
            let mount_id = r.u32()?;
            let mode = r.u32()?;
            let filename = r.string()?;
            Payload::Chmod {
                filename,
                mode,
                mount_id,
            }
        }
        EventKind::Chown => {
            let mount_id = r.u32()?;
            let uid = r.u32()?;
            let gid = r.u32()?;
            let filename = r.string()?;
            Payload::Chown {
                filename,
                uid,
                gid,
                mount_id,
            }
        }
        EventKind::Utime => {
            let mount_id = r.u32()?;
            let atime = r.u64()?;
            let mtime = r.u64()?;
            let filename = r.string()?;
            Payload::Utime {
                filename,
                atime,
                mtime,
                mount_id,
            }
        }
        EventKind::Link => {
            let mount_id = r.u32()?;
            let source = r.string()?;
            let destination = r.string()?;
            Payload::Link {
                source,
                destination,
                mount_id,
            }
        }
        EventKind::Mount => {
            let mount_id = r.u32()?;
            let parent_mount_id = r.u32()?;
            let device = r.u32()?;
            let fs_type = r.string()?;
            let mount_point = r.string()?;
            let root = r.string()?;
            Payload::Mount(MountRecord {
                mount_id,
                parent_mount_id,
                device,
                fs_type,
                mount_point,
                root,
            })
        }
        EventKind::Umount => {
            let mount_id = r.u32()?;
            Payload::Umount { mount_id }
        }
        EventKind::SetXattr => {
            let mount_id = r.u32()?;
            let filename = r.string()?;
            let name = r.string()?;
            Payload::SetXattr {
                filename,
                name,
                mount_id,
            }
        }
        EventKind::RemoveXattr => {
            let mount_id = r.u32()?;
            let filename = r.string()?;
            let name = r.string()?;
            Payload::RemoveXattr {
                filename,
                name,
                mount_id,
            }
        }
    };

    Ok((
        Event {
            header: EventHeader {
                kind,
                timestamp,
                pid,
                tid,
                retval,
            },
            payload,
        },
        r.offset,
    ))
}

/// Reference encoder mirroring [`decode`]. The kernel probes are the real
/// producer; this exists for fixtures and round-trip tests.
pub fn encode(event: &Event) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + 64);
    out.extend_from_slice(&(event.header.kind as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&event.header.timestamp.to_le_bytes());
    out.extend_from_slice(&(event.header.pid as u32).to_le_bytes());
    out.extend_from_slice(&event.header.tid.to_le_bytes());
    out.extend_from_slice(&event.header.retval.to_le_bytes());

    match &event.payload {
        Payload::Open {
            filename,
            flags,
            mode,
            mount_id,
        } => {
            put_u32(&mut out, *mount_id);
            put_u32(&mut out, *flags);
            put_u32(&mut out, *mode);
            put_str(&mut out, filename);
        }
        Payload::Mkdir {
            dirname,
            mode,
            mount_id,
        } => {
            put_u32(&mut out, *mount_id);
            put_u32(&mut out, *mode);
            put_str(&mut out, dirname);
        }
        Payload::Rmdir { dirname, mount_id } => {
            put_u32(&mut out, *mount_id);
            put_str(&mut out, dirname);
        }
        Payload::Unlink { filename, mount_id } => {
            put_u32(&mut out, *mount_id);
            put_str(&mut out, filename);
        }
        Payload::Rename {
            source,
            destination,
            mount_id,
        } => {
            put_u32(&mut out, *mount_id);
            put_str(&mut out, source);
            put_str(&mut out, destination);
        }
        Payload::Chmod {
            filename,
            mode,
            mount_id,
        } => {
            put_u32(&mut out, *mount_id);
            put_u32(&mut out, *mode);
            put_str(&mut out, filename);
        }
        Payload::Chown {
            filename,
            uid,
            gid,
            mount_id,
        } => {
            put_u32(&mut out, *mount_id);
            put_u32(&mut out, *uid);
            put_u32(&mut out, *gid);
            put_str(&mut out, filename);
        }
        Payload::Utime {
            filename,
            atime,
            mtime,
            mount_id,
        } => {
            put_u32(&mut out, *mount_id);
            out.extend_from_slice(&atime.to_le_bytes());
            out.extend_from_slice(&mtime.to_le_bytes());
            put_str(&mut out, filename);
        }
        Payload::Link {
            source,
            destination,
            mount_id,
        } => {
            put_u32(&mut out, *mount_id);
            put_str(&mut out, source);
            put_str(&mut out, destination);
        }
        Payload::Mount(record) => {
            put_u32(&mut out, record.mount_id);
            put_u32(&mut out, record.parent_mount_id);
            put_u32(&mut out, record.device);
            put_str(&mut out, &record.fs_type);
            put_str(&mut out, &record.mount_point);
            put_str(&mut out, &record.root);
        }
        Payload::Umount { mount_id } => {
            put_u32(&mut out, *mount_id);
        }
        Payload::SetXattr {
            filename,
            name,
            mount_id,
        }
        | Payload::RemoveXattr {
            filename,
            name,
            mount_id,
        } => {
            put_u32(&mut out, *mount_id);
            put_str(&mut out, filename);
            put_str(&mut out, name);
        }
    }
    out
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: EventKind, payload: Payload) -> Event {
        Event {
            header: EventHeader {
                kind,
                timestamp: 1_312_987,
                pid: 1999,
                tid: 2000,
                retval: 0,
            },
            payload,
        }
    }

    fn samples() -> Vec<Event> {
        vec![
            sample(
                EventKind::Open,
                Payload::Open {
                    filename: "etc/passwd".to_string(),
                    flags: 0o100,
                    mode: 0o644,
                    mount_id: 1,
                },
            ),
            sample(
                EventKind::Mkdir,
                Payload::Mkdir {
                    dirname: "tmp/build".to_string(),
                    mode: 0o755,
                    mount_id: 1,
                },
            ),
            sample(
                EventKind::Rmdir,
                Payload::Rmdir {
                    dirname: "tmp/build".to_string(),
                    mount_id: 1,
                },
            ),
            sample(
                EventKind::Unlink,
                Payload::Unlink {
                    filename: "tmp/lock".to_string(),
                    mount_id: 1,
                },
            ),
            sample(
                EventKind::Rename,
                Payload::Rename {
                    source: "a".to_string(),
                    destination: "b".to_string(),
                    mount_id: 1,
                },
            ),
            sample(
                EventKind::Chmod,
                Payload::Chmod {
                    filename: "bin/sh".to_string(),
                    mode: 0o4755,
                    mount_id: 1,
                },
            ),
            sample(
                EventKind::Chown,
                Payload::Chown {
                    filename: "bin/sh".to_string(),
                    uid: 0,
                    gid: 0,
                    mount_id: 1,
                },
            ),
            sample(
                EventKind::Utime,
                Payload::Utime {
                    filename: "var/log/syslog".to_string(),
                    atime: 1000,
                    mtime: 2000,
                    mount_id: 1,
                },
            ),
            sample(
                EventKind::Link,
                Payload::Link {
                    source: "a".to_string(),
                    destination: "b".to_string(),
                    mount_id: 1,
                },
            ),
            sample(
                EventKind::Mount,
                Payload::Mount(MountRecord {
                    mount_id: 4,
                    parent_mount_id: 1,
                    device: 42,
                    fs_type: "ext4".to_string(),
                    mount_point: "data".to_string(),
                    root: "/".to_string(),
                }),
            ),
            sample(EventKind::Umount, Payload::Umount { mount_id: 4 }),
            sample(
                EventKind::SetXattr,
                Payload::SetXattr {
                    filename: "etc/hosts".to_string(),
                    name: "user.comment".to_string(),
                    mount_id: 1,
                },
            ),
            sample(
                EventKind::RemoveXattr,
                Payload::RemoveXattr {
                    filename: "etc/hosts".to_string(),
                    name: "user.comment".to_string(),
                    mount_id: 1,
                },
            ),
        ]
    }

    #[test]
    fn round_trip_every_event_type() {
        for event in samples() {
            let buffer = encode(&event);
            let (decoded, read) = decode(&buffer).unwrap();
            assert_eq!(decoded, event);
            assert_eq!(read, buffer.len());
            assert_eq!(decoded.payload.kind(), event.header.kind);
        }
    }

    #[test]
    fn unknown_tag_is_terminal() {
        let mut buffer = encode(&samples()[0]);
        buffer[0..4].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(decode(&buffer), Err(DecodeError::UnsupportedType(99)));
    }

    #[test]
    fn truncated_header() {
        let buffer = encode(&samples()[0]);
        assert_eq!(
            decode(&buffer[..10]),
            Err(DecodeError::Truncated {
                offset: 8,
                expected: 8,
                len: 10
            })
        );
    }

    #[test]
    fn truncated_payload() {
        let buffer = encode(&samples()[0]);
        let cut = buffer.len() - 2;
        match decode(&buffer[..cut]) {
            Err(DecodeError::Truncated { offset, len, .. }) => {
                assert!(offset >= HEADER_LEN);
                assert_eq!(len, cut);
            }
            other => panic!("expected truncation error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_utf8_string() {
        let mut buffer = encode(&samples()[0]);
        let last = buffer.len() - 1;
        buffer[last] = 0xff;
        assert!(matches!(
            decode(&buffer),
            Err(DecodeError::NotAString { .. })
        ));
    }

    #[test]
    fn empty_buffer() {
        assert_eq!(
            decode(&[]),
            Err(DecodeError::Truncated {
                offset: 0,
                expected: 4,
                len: 0
            })
        );
    }
}
