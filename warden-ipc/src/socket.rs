//! Socket path derivation

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// `<tmp>/warden-<12 hex of sha256(project root)>.sock`
///
/// Every process that resolves the same project root finds the same daemon.
pub fn socket_path(project_root: &Path) -> PathBuf {
    socket_path_in(&std::env::temp_dir(), project_root)
}

pub fn socket_path_in(dir: &Path, project_root: &Path) -> PathBuf {
    let digest = Sha256::digest(project_root.to_string_lossy().as_bytes());
    let hex: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();
    dir.join(format!("warden-{}.sock", hex))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_per_project() {
        let a = socket_path(Path::new("/work/repo"));
        let b = socket_path(Path::new("/work/repo"));
        let c = socket_path(Path::new("/work/other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_shape() {
        let path = socket_path_in(Path::new("/tmp"), Path::new("/work/repo"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("warden-") && name.ends_with(".sock"));
        let hex = &name["warden-".len()..name.len() - ".sock".len()];
        assert_eq!(hex.len(), 12);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
