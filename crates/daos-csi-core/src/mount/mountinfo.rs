//! Parsing of `/proc/self/mountinfo`.
//!
//! Reading the mount table avoids `stat(2)` on the target, which fails
//! with `ENOTCONN` once a FUSE daemon has gone away.

use std::path::{Path, PathBuf};

use daos_csi_common::error::{CsiError, Result};

/// Mount table of the calling process.
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Extracts the mount point column from mountinfo content.
///
/// Lines with fewer than five fields are skipped.
pub fn parse_mount_points(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

/// Returns whether `path` appears as a mount point in `mountinfo`.
///
/// # Errors
///
/// Returns an error if the mount table cannot be read.
pub fn is_listed(mountinfo: &Path, path: &Path) -> Result<bool> {
    let content = std::fs::read_to_string(mountinfo).map_err(|e| CsiError::Io {
        path: mountinfo.to_path_buf(),
        source: e,
    })?;
    let wanted = normalize(path);
    Ok(parse_mount_points(&content)
        .iter()
        .any(|mp| normalize(mp) == wanted))
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Decodes the `\ooo` octal escapes the kernel uses for whitespace and
/// backslashes in mount paths.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
35 22 0:30 / /proc rw,nosuid,nodev,noexec,relatime shared:13 - proc proc rw
512 22 0:55 / /var/lib/kubelet/pods/p1/volumes/kubernetes.io~csi/v1/mount rw,nosuid,nodev,relatime shared:300 - fuse poolA/containerB rw,user_id=0,group_id=0,default_permissions,allow_other
513 22 0:56 / /mnt/with\\040space rw - tmpfs tmpfs rw
";

    #[test]
    fn extracts_mount_points() {
        let points = parse_mount_points(SAMPLE);
        assert_eq!(points.len(), 4);
        assert_eq!(points[1], PathBuf::from("/proc"));
    }

    #[test]
    fn decodes_octal_escapes() {
        let points = parse_mount_points(SAMPLE);
        assert_eq!(points[3], PathBuf::from("/mnt/with space"));
    }

    #[test]
    fn lone_backslash_is_kept() {
        assert_eq!(unescape("a\\b"), "a\\b");
        assert_eq!(unescape("tail\\"), "tail\\");
        assert_eq!(unescape("\\134x"), "\\x");
    }

    #[test]
    fn is_listed_reads_table_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = dir.path().join("mountinfo");
        std::fs::write(&table, SAMPLE).expect("write");

        let target = Path::new("/var/lib/kubelet/pods/p1/volumes/kubernetes.io~csi/v1/mount");
        assert!(is_listed(&table, target).expect("read"));
        assert!(is_listed(&table, Path::new("/proc/")).expect("read"));
        assert!(!is_listed(&table, Path::new("/var/lib/kubelet")).expect("read"));
    }

    #[test]
    fn is_listed_missing_table_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(is_listed(&dir.path().join("absent"), Path::new("/")).is_err());
    }
}
