//! Process identities: the userspace cache value and the record shared with
//! kernel probes through the `proc_cache` map.

use std::time::SystemTime;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Width of the NUL padded container id field.
pub const CONTAINER_ID_LEN: usize = 64;

/// Size of a serialized [`ProcCacheEntry`].
pub const PROC_CACHE_ENTRY_SIZE: usize = 96;

/// Resolved identity of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResolverEntry {
    pub pathname: String,
    /// Process creation time. Unknown for entries pre-filled by the snapshot.
    pub timestamp: Option<SystemTime>,
}

/// Kernel identity of a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FileEvent {
    pub inode: u64,
    pub mount_id: u32,
    /// Number of overlay lower layers below the file, negative when unknown.
    pub overlay_num_lower: i32,
    pub path_id: u32,
}

/// Value of the `proc_cache` kernel map.
///
/// Layout, host byte order:
///
/// ```text
///  0..64  container id, NUL padded
/// 64..72  inode
/// 72..76  mount id
/// 76..80  overlay numlower
/// 80..84  path id
/// 84..88  padding
/// 88..96  creation time, ns since boot
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcCacheEntry {
    pub container_id: String,
    pub file: FileEvent,
    pub timestamp_raw: u64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("cache entry too short: expected {expected} bytes, found {found}")]
    TooShort { expected: usize, found: usize },
    #[error("container id is not valid UTF-8")]
    InvalidContainerId(#[source] std::str::Utf8Error),
}

impl ProcCacheEntry {
    pub fn encode(&self) -> Vec<u8> {
        let container_id = truncate(&self.container_id, CONTAINER_ID_LEN).as_bytes();
        let mut buf = BytesMut::with_capacity(PROC_CACHE_ENTRY_SIZE);
        buf.put_slice(container_id);
        buf.put_bytes(0, CONTAINER_ID_LEN - container_id.len());
        buf.put_u64_ne(self.file.inode);
        buf.put_u32_ne(self.file.mount_id);
        buf.put_i32_ne(self.file.overlay_num_lower);
        buf.put_u32_ne(self.file.path_id);
        buf.put_bytes(0, 4);
        buf.put_u64_ne(self.timestamp_raw);
        buf.to_vec()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < PROC_CACHE_ENTRY_SIZE {
            return Err(CodecError::TooShort {
                expected: PROC_CACHE_ENTRY_SIZE,
                found: buf.len(),
            });
        }
        let raw_id = &buf[..CONTAINER_ID_LEN];
        let id_len = raw_id.iter().position(|b| *b == 0).unwrap_or(CONTAINER_ID_LEN);
        let container_id = std::str::from_utf8(&raw_id[..id_len])
            .map_err(CodecError::InvalidContainerId)?
            .to_string();
        buf.advance(CONTAINER_ID_LEN);
        let file = FileEvent {
            inode: buf.get_u64_ne(),
            mount_id: buf.get_u32_ne(),
            overlay_num_lower: buf.get_i32_ne(),
            path_id: buf.get_u32_ne(),
        };
        buf.advance(4);
        Ok(Self {
            container_id,
            file,
            timestamp_raw: buf.get_u64_ne(),
        })
    }
}

/// Longest prefix of `s` fitting in `max` bytes without splitting a character.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
