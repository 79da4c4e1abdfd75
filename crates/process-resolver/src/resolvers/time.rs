use std::time::SystemTime;

use bpf_common::time::{BootTime, Timestamp};

use super::TimeResolver;

pub struct BootTimeResolver {
    boot: BootTime,
}

impl BootTimeResolver {
    pub fn new(boot: BootTime) -> Self {
        Self { boot }
    }

    pub fn detect() -> Self {
        Self::new(BootTime::detect())
    }
}

impl TimeResolver for BootTimeResolver {
    fn resolve_monotonic_timestamp(&self, raw: u64) -> SystemTime {
        self.boot.to_system_time(Timestamp::from(raw))
    }
}
