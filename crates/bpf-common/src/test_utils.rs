//! In-memory stand-ins for kernel maps and kprobes.
//!
//! [`MemoryProgram`] implements [`MapRegistry`] and [`ProbeManager`] without
//! touching the kernel. Map handles returned by the registry share their
//! content with the [`MemoryMap`] kept by the test, so a test can seed maps
//! before handing the program over and inspect them afterwards.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    KprobeTarget, ProbeManager, ProgramError,
    maps::{KernelMap, MapError, MapRegistry, NativeBytes},
};

/// Operations performed through [`KernelMap`] on a [`MemoryMap`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MapStats {
    pub gets: usize,
    pub sets: usize,
    pub deletes: usize,
}

impl MapStats {
    pub fn writes(&self) -> usize {
        self.sets + self.deletes
    }
}

type SetHook = Box<dyn Fn(&[u8], &[u8]) + Send>;

#[derive(Default)]
struct MemoryMapState {
    entries: HashMap<Vec<u8>, Vec<u8>>,
    sizes: Option<(usize, usize)>,
    max_entries: Option<usize>,
    stats: MapStats,
    on_set: Option<SetHook>,
}

/// A hash map shared between a test and the code under test.
#[derive(Clone, Default)]
pub struct MemoryMap {
    inner: Arc<Mutex<MemoryMapState>>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryMapState> {
        // a panicking hook must not hide the map content from the test
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert without going through [`KernelMap`]: not counted in [`MapStats`].
    pub fn seed<K: NativeBytes, V: NativeBytes>(&self, key: K, value: V) {
        self.seed_raw(key.to_ne_vec(), value.to_ne_vec());
    }

    pub fn seed_raw(&self, key: Vec<u8>, value: Vec<u8>) {
        self.state().entries.insert(key, value);
    }

    pub fn peek<K: NativeBytes, V: NativeBytes>(&self, key: K) -> Option<V> {
        self.peek_raw(&key.to_ne_vec())
            .and_then(|value| V::from_ne_slice(&value).ok())
    }

    pub fn peek_raw(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state().entries.get(key).cloned()
    }

    pub fn contains<K: NativeBytes>(&self, key: K) -> bool {
        self.state().entries.contains_key(&key.to_ne_vec())
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MapStats {
        self.state().stats
    }

    pub fn reset_stats(&self) {
        self.state().stats = MapStats::default();
    }

    /// Refuse inserting new keys once `max_entries` is reached, as the kernel does.
    pub fn set_max_entries(&self, max_entries: usize) {
        self.state().max_entries = Some(max_entries);
    }

    /// Call `hook` with key and value before every successful [`KernelMap::set`].
    pub fn on_set(&self, hook: impl Fn(&[u8], &[u8]) + Send + 'static) {
        self.state().on_set = Some(Box::new(hook));
    }

    fn check_size(expected: Option<usize>, buffer: &[u8]) -> Result<(), MapError> {
        match expected {
            Some(expected) if expected != buffer.len() => Err(MapError::InvalidSize {
                expected,
                found: buffer.len(),
            }),
            _ => Ok(()),
        }
    }
}

impl KernelMap for MemoryMap {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, MapError> {
        let mut state = self.state();
        state.stats.gets += 1;
        Self::check_size(state.sizes.map(|(k, _)| k), key)?;
        state.entries.get(key).cloned().ok_or(MapError::KeyNotFound)
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), MapError> {
        let mut state = self.state();
        state.stats.sets += 1;
        Self::check_size(state.sizes.map(|(k, _)| k), key)?;
        Self::check_size(state.sizes.map(|(_, v)| v), value)?;
        if let Some(max_entries) = state.max_entries {
            if !state.entries.contains_key(key) && state.entries.len() >= max_entries {
                return Err(MapError::Full { max_entries });
            }
        }
        if let Some(hook) = &state.on_set {
            hook(key, value);
        }
        state.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), MapError> {
        let mut state = self.state();
        state.stats.deletes += 1;
        state
            .entries
            .remove(key)
            .map(|_| ())
            .ok_or(MapError::KeyNotFound)
    }
}

#[derive(Debug, Default)]
struct ProbeLogState {
    attached: HashSet<String>,
    attaches: usize,
    detaches: usize,
}

/// Records kprobe activations of a [`MemoryProgram`].
#[derive(Debug, Clone, Default)]
pub struct ProbeLog {
    inner: Arc<Mutex<ProbeLogState>>,
}

impl ProbeLog {
    fn state(&self) -> MutexGuard<'_, ProbeLogState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True while a kprobe hooks the given kernel function.
    pub fn is_attached(&self, function: &str) -> bool {
        self.state().attached.contains(function)
    }

    pub fn attaches(&self) -> usize {
        self.state().attaches
    }

    pub fn detaches(&self) -> usize {
        self.state().detaches
    }
}

/// In-memory [`MapRegistry`] and [`ProbeManager`].
#[derive(Default)]
pub struct MemoryProgram {
    maps: HashMap<String, MemoryMap>,
    registered: HashSet<String>,
    probes: ProbeLog,
    failing_probes: HashSet<String>,
}

impl MemoryProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a map which is registered from the start.
    pub fn with_map(mut self, name: &str) -> Self {
        self.maps.insert(name.to_string(), MemoryMap::new());
        self.registered.insert(name.to_string());
        self
    }

    /// Add a map which exists but must be registered before use.
    pub fn with_unregistered_map(mut self, name: &str) -> Self {
        self.maps.insert(name.to_string(), MemoryMap::new());
        self
    }

    /// Make attaching the given kprobe program fail.
    pub fn with_failing_probe(mut self, program: &str) -> Self {
        self.failing_probes.insert(program.to_string());
        self
    }

    /// Shared handle to a map. Panics if the map doesn't exist.
    pub fn memory_map(&self, name: &str) -> MemoryMap {
        self.maps
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("map {name} not defined"))
    }

    pub fn probes(&self) -> ProbeLog {
        self.probes.clone()
    }
}

impl MapRegistry for MemoryProgram {
    fn register_map(&mut self, name: &str) -> Result<(), ProgramError> {
        if !self.maps.contains_key(name) {
            return Err(ProgramError::MapNotFound(name.to_string()));
        }
        self.registered.insert(name.to_string());
        Ok(())
    }

    fn map<const K: usize, const V: usize>(
        &mut self,
        name: &str,
    ) -> Result<Box<dyn KernelMap>, ProgramError> {
        if !self.registered.contains(name) {
            return Err(ProgramError::MapNotRegistered(name.to_string()));
        }
        let map = self
            .maps
            .get(name)
            .cloned()
            .ok_or_else(|| ProgramError::MapNotFound(name.to_string()))?;
        map.state().sizes = Some((K, V));
        Ok(Box::new(map))
    }
}

impl ProbeManager for MemoryProgram {
    fn attach_kprobe(&mut self, kprobe: &KprobeTarget) -> Result<(), ProgramError> {
        if self.failing_probes.contains(&kprobe.program) {
            return Err(ProgramError::ProgramNotFound(kprobe.program.clone()));
        }
        let mut state = self.probes.state();
        state.attaches += 1;
        state.attached.insert(kprobe.function.clone());
        Ok(())
    }

    fn detach_kprobe(&mut self, kprobe: &KprobeTarget) -> Result<(), ProgramError> {
        let mut state = self.probes.state();
        if !state.attached.remove(&kprobe.function) {
            return Err(ProgramError::ProbeNotAttached(kprobe.to_string()));
        }
        state.detaches += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::KernelMapExt;

    #[test]
    fn handles_share_content() {
        let mut program = MemoryProgram::new().with_map("pid_cookie");
        let shared = program.memory_map("pid_cookie");
        let mut handle = program.map::<4, 4>("pid_cookie").unwrap();

        handle.update(10_u32, 99_u32).unwrap();
        assert_eq!(shared.peek::<u32, u32>(10), Some(99));
        shared.seed(11_u32, 100_u32);
        assert_eq!(handle.lookup::<u32, u32>(11).unwrap(), 100);
        assert_eq!(
            shared.stats(),
            MapStats {
                gets: 1,
                sets: 1,
                deletes: 0
            }
        );
    }

    #[test]
    fn registration_is_required() {
        let mut program = MemoryProgram::new().with_unregistered_map("inode_numlower");
        assert!(matches!(
            program.map::<8, 4>("inode_numlower"),
            Err(ProgramError::MapNotRegistered(_))
        ));
        program.register_map("inode_numlower").unwrap();
        assert!(program.map::<8, 4>("inode_numlower").is_ok());
        assert!(matches!(
            program.register_map("missing"),
            Err(ProgramError::MapNotFound(_))
        ));
    }

    #[test]
    fn sizes_are_enforced() {
        let mut program = MemoryProgram::new().with_map("inode_numlower");
        let mut handle = program.map::<8, 4>("inode_numlower").unwrap();
        assert!(matches!(
            handle.update(1_u32, 1_u32),
            Err(MapError::InvalidSize {
                expected: 8,
                found: 4
            })
        ));
        assert!(handle.update(1_u64, 1_i32).is_ok());
    }

    #[test]
    fn full_map_refuses_new_keys() {
        let mut map = MemoryMap::new();
        map.set_max_entries(1);
        map.update(1_u32, 1_u32).unwrap();
        map.update(1_u32, 2_u32).unwrap();
        assert!(matches!(
            map.update(2_u32, 1_u32),
            Err(MapError::Full { max_entries: 1 })
        ));
    }

    #[test]
    fn probe_activations_are_recorded() {
        let mut program = MemoryProgram::new();
        let probes = program.probes();
        let getattr = KprobeTarget {
            program: "kprobe_vfs_getattr".to_string(),
            function: "vfs_getattr".to_string(),
        };
        program.attach_kprobe(&getattr).unwrap();
        assert!(probes.is_attached("vfs_getattr"));
        program.detach_kprobe(&getattr).unwrap();
        assert!(!probes.is_attached("vfs_getattr"));
        assert!(program.detach_kprobe(&getattr).is_err());
        assert_eq!((probes.attaches(), probes.detaches()), (1, 1));
    }
}
