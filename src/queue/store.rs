//! Queue snapshot persistence.
//!
//! Each PERMANENT queue is persisted wholesale to
//! `<repository>/repo/<NAME>.qbk`. Layout (big-endian):
//!
//! ```text
//! File   => Magic Version Threshold Count Record*
//! Magic  => 4 bytes, "RQBK"
//! Record => [len: u32][crc32: u32 over payload][payload]
//! ```
//!
//! The record payload is the wire message encoding, so snapshot and socket
//! share one serializer. A bad magic, short read, or CRC mismatch is
//! reported to the caller, which treats the queue as "did not previously
//! exist".

use super::Queue;
use crate::protocol::codec::{decode_message, encode_message};
use crate::protocol::QueueMessage;
use crate::{RelayError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fs;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_EXT: &str = "qbk";

const SNAPSHOT_MAGIC: [u8; 4] = *b"RQBK";
const SNAPSHOT_VERSION: u8 = 1;

/// One parsed `.qbk` file.
#[derive(Debug)]
pub struct Snapshot {
    pub name: String,
    pub threshold: usize,
    pub messages: Vec<QueueMessage>,
}

pub fn snapshot_path(repo_dir: &Path, queue_name: &str) -> PathBuf {
    repo_dir.join(format!("{}.{}", queue_name, SNAPSHOT_EXT))
}

/// Write the queue's current contents to its snapshot file, returning the
/// persisted message count.
pub fn write_snapshot(repo_dir: &Path, queue: &Queue) -> Result<usize> {
    if !super::valid_name(queue.name()) {
        return Err(RelayError::Protocol(format!(
            "refusing snapshot for queue name '{}'",
            queue.name()
        )));
    }
    let messages = queue.snapshot_messages();

    let mut buf = BytesMut::new();
    buf.put_slice(&SNAPSHOT_MAGIC);
    buf.put_u8(SNAPSHOT_VERSION);
    buf.put_u32(queue.threshold().min(u32::MAX as usize) as u32);
    buf.put_u32(messages.len() as u32);

    for message in &messages {
        let mut payload = BytesMut::new();
        encode_message(message, &mut payload)?;
        buf.put_u32(payload.len() as u32);
        buf.put_u32(crc32fast::hash(&payload));
        buf.put_slice(&payload);
    }

    fs::write(snapshot_path(repo_dir, queue.name()), &buf)?;
    Ok(messages.len())
}

/// Read one snapshot file back. The queue name is the uppercased file stem.
pub fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(super::normalize)
        .ok_or_else(|| corrupt(path, "snapshot file has no usable name"))?;
    if !super::valid_name(&name) {
        return Err(corrupt(path, "invalid queue name"));
    }

    let mut buf = Bytes::from(fs::read(path)?);
    if buf.remaining() < 13 {
        return Err(corrupt(path, "snapshot header truncated"));
    }

    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != SNAPSHOT_MAGIC {
        return Err(corrupt(path, "bad snapshot magic"));
    }
    let version = buf.get_u8();
    if version != SNAPSHOT_VERSION {
        return Err(corrupt(
            path,
            &format!("unsupported snapshot version {}", version),
        ));
    }
    let threshold = buf.get_u32() as usize;
    let count = buf.get_u32() as usize;

    let mut messages = Vec::with_capacity(count.min(1024));
    for index in 0..count {
        if buf.remaining() < 8 {
            return Err(corrupt(path, &format!("record {} header truncated", index)));
        }
        let len = buf.get_u32() as usize;
        let crc = buf.get_u32();
        if buf.remaining() < len {
            return Err(corrupt(path, &format!("record {} truncated", index)));
        }
        let mut payload = buf.split_to(len);
        if crc32fast::hash(&payload) != crc {
            return Err(corrupt(path, &format!("record {} crc mismatch", index)));
        }
        messages.push(decode_message(&mut payload)?);
    }

    Ok(Snapshot {
        name,
        threshold,
        messages,
    })
}

fn corrupt(path: &Path, detail: &str) -> RelayError {
    RelayError::Protocol(format!("snapshot {}: {}", path.display(), detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Disposition;

    #[test]
    fn snapshot_round_trip_preserves_order_and_properties() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = Queue::new("APPQ", 8, Disposition::Permanent);
        queue.push(QueueMessage::new("first")).unwrap();
        queue
            .push(QueueMessage::new("second").with_property("k", "v"))
            .unwrap();

        let written = write_snapshot(dir.path(), &queue).unwrap();
        assert_eq!(written, 2);

        let snapshot = read_snapshot(&snapshot_path(dir.path(), "APPQ")).unwrap();
        assert_eq!(snapshot.name, "APPQ");
        assert_eq!(snapshot.threshold, 8);
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].body, "first");
        assert_eq!(snapshot.messages[1].properties, vec![(
            "k".to_string(),
            "v".to_string()
        )]);
    }

    #[test]
    fn path_like_queue_name_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = Queue::new("../ESCAPE", 4, Disposition::Permanent);
        assert!(write_snapshot(dir.path(), &queue).is_err());
        assert!(!dir.path().parent().unwrap().join("ESCAPE.qbk").exists());
    }

    #[test]
    fn corrupt_magic_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = snapshot_path(dir.path(), "BAD");
        fs::write(&path, b"not a snapshot at all").unwrap();
        assert!(read_snapshot(&path).is_err());
    }

    #[test]
    fn flipped_record_byte_fails_crc() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = Queue::new("APPQ", 8, Disposition::Permanent);
        queue.push(QueueMessage::new("payload")).unwrap();
        write_snapshot(dir.path(), &queue).unwrap();

        let path = snapshot_path(dir.path(), "APPQ");
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        let err = read_snapshot(&path).unwrap_err();
        assert!(err.to_string().contains("crc"));
    }
}
