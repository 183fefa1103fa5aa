use nix::errno::Errno;
use std::io;
use std::path::Path;
use tempfile::NamedTempFile;

/// Whether `dir` sits on a read-only filesystem, found out by creating (and
/// immediately dropping) a scratch file in it.
pub fn is_read_only(dir: &Path) -> io::Result<bool> {
    match NamedTempFile::new_in(dir) {
        Ok(_) => Ok(false),
        Err(e) if e.raw_os_error() == Some(Errno::EROFS as i32) => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writable_directory() {
        let dir = TempDir::new().unwrap();
        assert!(!is_read_only(dir.path()).unwrap());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(is_read_only(&dir.path().join("boot")).is_err());
    }
}
