//! Byte level access to eBPF hash maps shared with kernel probes.
//!
//! Keys and values cross the user/kernel boundary as fixed-width buffers in
//! host byte order. Integers are turned into such buffers only through
//! [`NativeBytes`], so widths and byte order are decided in one place.

use aya::maps::{HashMap, Map, MapData};
use thiserror::Error;

use crate::{Pid, ProgramError};

#[derive(Error, Debug)]
pub enum MapError {
    #[error("key not found")]
    KeyNotFound,
    #[error("invalid buffer size: expected {expected} bytes, found {found}")]
    InvalidSize { expected: usize, found: usize },
    #[error("map is full ({max_entries} entries)")]
    Full { max_entries: usize },
    #[error(transparent)]
    Aya(#[from] aya::maps::MapError),
}

/// A kernel resident hash map addressed by raw bytes.
pub trait KernelMap: Send {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, MapError>;
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), MapError>;
    fn delete(&mut self, key: &[u8]) -> Result<(), MapError>;
}

/// Typed helpers on top of [`KernelMap`].
pub trait KernelMapExt: KernelMap {
    fn lookup<K: NativeBytes, V: NativeBytes>(&self, key: K) -> Result<V, MapError> {
        V::from_ne_slice(&self.get(&key.to_ne_vec())?)
    }

    fn update<K: NativeBytes, V: NativeBytes>(&mut self, key: K, value: V) -> Result<(), MapError> {
        self.set(&key.to_ne_vec(), &value.to_ne_vec())
    }

    fn remove<K: NativeBytes>(&mut self, key: K) -> Result<(), MapError> {
        self.delete(&key.to_ne_vec())
    }
}

impl<T: KernelMap + ?Sized> KernelMapExt for T {}

/// Registry of the named maps of a loaded program.
///
/// A map must be registered before a handle to it can be taken. `K` and `V`
/// are the key and value sizes in bytes, they must match the map definition
/// of the eBPF object.
pub trait MapRegistry {
    fn register_map(&mut self, name: &str) -> Result<(), ProgramError>;

    fn map<const K: usize, const V: usize>(
        &mut self,
        name: &str,
    ) -> Result<Box<dyn KernelMap>, ProgramError>;
}

/// Fixed-width, host byte order encoding of map keys and values.
pub trait NativeBytes: Sized {
    const SIZE: usize;

    fn to_ne_vec(&self) -> Vec<u8>;

    fn from_ne_slice(bytes: &[u8]) -> Result<Self, MapError>;
}

macro_rules! impl_native_bytes {
    ($($t:ty),*) => {
        $(
            impl NativeBytes for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn to_ne_vec(&self) -> Vec<u8> {
                    self.to_ne_bytes().to_vec()
                }

                fn from_ne_slice(bytes: &[u8]) -> Result<Self, MapError> {
                    Ok(<$t>::from_ne_bytes(fixed(bytes)?))
                }
            }
        )*
    };
}

impl_native_bytes!(u32, u64, i32);

impl NativeBytes for Pid {
    const SIZE: usize = 4;

    fn to_ne_vec(&self) -> Vec<u8> {
        (self.as_raw() as u32).to_ne_vec()
    }

    fn from_ne_slice(bytes: &[u8]) -> Result<Self, MapError> {
        Ok(Pid::from_raw(u32::from_ne_slice(bytes)? as i32))
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], MapError> {
    bytes.try_into().map_err(|_| MapError::InvalidSize {
        expected: N,
        found: bytes.len(),
    })
}

/// [`KernelMap`] backed by a `BPF_MAP_TYPE_HASH` of an aya program.
pub(crate) struct AyaMap<const K: usize, const V: usize> {
    inner: HashMap<MapData, [u8; K], [u8; V]>,
}

impl<const K: usize, const V: usize> AyaMap<K, V> {
    pub(crate) fn new(map: Map) -> Result<Self, ProgramError> {
        Ok(Self {
            inner: HashMap::try_from(map)?,
        })
    }
}

impl<const K: usize, const V: usize> KernelMap for AyaMap<K, V> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, MapError> {
        match self.inner.get(&fixed::<K>(key)?, 0) {
            Ok(value) => Ok(value.to_vec()),
            Err(aya::maps::MapError::KeyNotFound) => Err(MapError::KeyNotFound),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), MapError> {
        self.inner
            .insert(fixed::<K>(key)?, fixed::<V>(value)?, 0)
            .map_err(MapError::from)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), MapError> {
        match self.inner.remove(&fixed::<K>(key)?) {
            Ok(()) => Ok(()),
            Err(aya::maps::MapError::KeyNotFound) => Err(MapError::KeyNotFound),
            Err(err) => Err(err.into()),
        }
    }
}
