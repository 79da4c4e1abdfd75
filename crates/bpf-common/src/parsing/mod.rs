pub mod mountinfo;
pub mod procfs;
