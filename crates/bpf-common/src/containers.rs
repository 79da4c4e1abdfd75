use std::fmt;

/// A container ID, as found in the cgroup of a containerized process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerId {
    Docker(String),
    Libpod(String),
}

impl ContainerId {
    pub fn as_str(&self) -> &str {
        match self {
            ContainerId::Docker(id) | ContainerId::Libpod(id) => id,
        }
    }

    pub fn into_string(self) -> String {
        match self {
            ContainerId::Docker(id) | ContainerId::Libpod(id) => id,
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
