use std::path::Path;

use bpf_common::{KernelMap, MapError};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use super::{PathResolver, Resolvers};
use crate::entry::FileEvent;

/// Deepest dentry chain walked before giving up.
pub const MAX_PATH_DEPTH: usize = 1024;

pub const PATH_KEY_SIZE: usize = 16;
pub const PATH_NAME_LEN: usize = 256;
pub const PATH_LEAF_SIZE: usize = PATH_KEY_SIZE + PATH_NAME_LEN;

#[derive(Error, Debug)]
pub enum PathError {
    #[error("dentry not found")]
    NotFound,
    #[error("dentry chain broken at depth {depth}")]
    Incomplete { depth: usize },
    #[error("dentry chain deeper than {MAX_PATH_DEPTH}")]
    TooDeep,
    #[error("reading pathnames map")]
    Map(#[from] MapError),
}

/// Key of the `pathnames` kernel map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PathKey {
    pub inode: u64,
    pub mount_id: u32,
    pub path_id: u32,
}

impl From<&FileEvent> for PathKey {
    fn from(file: &FileEvent) -> Self {
        Self {
            inode: file.inode,
            mount_id: file.mount_id,
            path_id: file.path_id,
        }
    }
}

impl PathKey {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(PATH_KEY_SIZE);
        self.put(&mut buf);
        buf.to_vec()
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64_ne(self.inode);
        buf.put_u32_ne(self.mount_id);
        buf.put_u32_ne(self.path_id);
    }

    fn get(buf: &mut &[u8]) -> Self {
        Self {
            inode: buf.get_u64_ne(),
            mount_id: buf.get_u32_ne(),
            path_id: buf.get_u32_ne(),
        }
    }
}

/// Value of the `pathnames` kernel map: one dentry and a link to its parent.
/// The root of a mount has a parent with inode 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLeaf {
    pub parent: PathKey,
    pub name: String,
}

impl PathLeaf {
    pub fn encode(&self) -> Vec<u8> {
        let name = &self.name.as_bytes()[..self.name.len().min(PATH_NAME_LEN - 1)];
        let mut buf = BytesMut::with_capacity(PATH_LEAF_SIZE);
        self.parent.put(&mut buf);
        buf.put_slice(name);
        buf.put_bytes(0, PATH_NAME_LEN - name.len());
        buf.to_vec()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, MapError> {
        if buf.len() < PATH_LEAF_SIZE {
            return Err(MapError::InvalidSize {
                expected: PATH_LEAF_SIZE,
                found: buf.len(),
            });
        }
        let parent = PathKey::get(&mut buf);
        let raw_name = &buf[..PATH_NAME_LEN];
        let len = raw_name.iter().position(|b| *b == 0).unwrap_or(PATH_NAME_LEN);
        Ok(Self {
            parent,
            name: String::from_utf8_lossy(&raw_name[..len]).into_owned(),
        })
    }
}

/// Rebuilds file paths from the dentry tree the kernel probes store in the
/// `pathnames` map, then prefixes the mount point.
pub struct DentryResolver {
    pathnames: Box<dyn KernelMap>,
}

impl DentryResolver {
    pub fn new(pathnames: Box<dyn KernelMap>) -> Self {
        Self { pathnames }
    }

    /// Path relative to the mount root, leaf first.
    fn walk(&self, file: &FileEvent) -> Result<Vec<String>, PathError> {
        let mut key = PathKey::from(file);
        let mut names = Vec::new();
        for depth in 0..MAX_PATH_DEPTH {
            let leaf = match self.pathnames.get(&key.encode()) {
                Ok(raw) => PathLeaf::decode(&raw)?,
                Err(MapError::KeyNotFound) if depth == 0 => return Err(PathError::NotFound),
                Err(MapError::KeyNotFound) => return Err(PathError::Incomplete { depth }),
                Err(err) => return Err(err.into()),
            };
            if leaf.parent.inode == 0 {
                return Ok(names);
            }
            names.push(leaf.name);
            key = leaf.parent;
        }
        Err(PathError::TooDeep)
    }
}

impl PathResolver for DentryResolver {
    fn resolve_inode(&self, file: &FileEvent, resolvers: &Resolvers) -> Result<String, PathError> {
        let names = self.walk(file)?;
        let relative: String = names.iter().rev().map(|name| format!("/{name}")).collect();
        // Unknown mounts resolve relative to the root.
        let mount_point = resolvers
            .mounts
            .mount_point(file.mount_id)
            .filter(|mount_point| mount_point.as_path() != Path::new("/"));
        Ok(match (mount_point, relative.is_empty()) {
            (None, true) => "/".to_string(),
            (None, false) => relative,
            (Some(mount_point), _) => {
                format!("{}{relative}", mount_point.to_string_lossy().trim_end_matches('/'))
            }
        })
    }
}
