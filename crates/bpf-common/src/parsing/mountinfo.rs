use std::path::PathBuf;

/// A single line of `/proc/<pid>/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_id: u32,
    pub parent_id: u32,
    /// Root of the mount within the filesystem
    pub root: PathBuf,
    /// Mount point relative to the process root
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

/// Parses mount information provided by the kernel, usually available in
/// `/proc/<pid>/mountinfo`.
///
/// The format of the information is described in
/// [the kernel documentation](https://www.kernel.org/doc/Documentation/filesystems/proc.txt).
/// To sum it up, each line contains the following fields:
///
/// ```ignore
/// 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
/// (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
/// ```
///
/// Field 7 is optional, but might occur multiple times. The purpose of
/// separator `-` is to make it clear where the field 9 starts.
///
/// Malformed lines are skipped.
pub fn parse_mountinfo(content: &str) -> Vec<MountInfo> {
    content.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MountInfo> {
    // The separator is a standalone `-`: paths may contain dashes.
    let (mount_info, filesystem_info) = line.split_once(" - ")?;

    let mount_parts: Vec<&str> = mount_info.split_whitespace().collect();
    let mut filesystem_parts = filesystem_info.split_whitespace();

    Some(MountInfo {
        mount_id: mount_parts.first()?.parse().ok()?,
        parent_id: mount_parts.get(1)?.parse().ok()?,
        root: PathBuf::from(unescape(mount_parts.get(3)?)),
        mount_point: PathBuf::from(unescape(mount_parts.get(4)?)),
        fs_type: filesystem_parts.next()?.to_string(),
        source: filesystem_parts.next().unwrap_or_default().to_string(),
    })
}

/// The kernel escapes space, tab, newline and backslash as `\ooo` octal sequences.
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|octal| u8::from_str_radix(octal, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
