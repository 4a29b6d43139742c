use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

pub const STATE_DIR_NAME: &str = ".sectap";

/// Filesystem layout derived from the working directory. Computed once at
/// startup and never mutated; every component resolves its paths through
/// this record.
#[derive(Debug, Clone)]
pub struct ServicePaths {
    pub work_dir: PathBuf,
    /// Hidden state root, mode 0700.
    pub state_root: PathBuf,
    pub config_path: PathBuf,
    pub service_dir: PathBuf,
    pub pid_path: PathBuf,
    pub socket_path: PathBuf,
    pub log_path: PathBuf,
    pub bundle_root: PathBuf,
}

impl ServicePaths {
    pub fn new(work_dir: &Path) -> Self {
        let state_root = work_dir.join(STATE_DIR_NAME);
        let service_dir = state_root.join("service");
        ServicePaths {
            work_dir: work_dir.to_path_buf(),
            config_path: state_root.join("config.json"),
            pid_path: service_dir.join("pid"),
            socket_path: service_dir.join("socket"),
            log_path: service_dir.join("log.txt"),
            bundle_root: state_root.join("requests"),
            service_dir,
            state_root,
        }
    }

    /// Create the state root and its subdirectories with owner-only access.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [&self.state_root, &self.service_dir, &self.bundle_root] {
            match DirBuilder::new().mode(0o700).create(dir) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn paths_derive_from_work_dir() {
        let paths = ServicePaths::new(Path::new("/work"));
        assert_eq!(paths.state_root, Path::new("/work/.sectap"));
        assert_eq!(paths.config_path, Path::new("/work/.sectap/config.json"));
        assert_eq!(paths.pid_path, Path::new("/work/.sectap/service/pid"));
        assert_eq!(paths.socket_path, Path::new("/work/.sectap/service/socket"));
        assert_eq!(paths.log_path, Path::new("/work/.sectap/service/log.txt"));
        assert_eq!(paths.bundle_root, Path::new("/work/.sectap/requests"));
    }

    #[test]
    fn ensure_dirs_creates_owner_only_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = ServicePaths::new(tmp.path());
        paths.ensure_dirs().unwrap();

        for dir in [&paths.state_root, &paths.service_dir, &paths.bundle_root] {
            let meta = std::fs::metadata(dir).unwrap();
            assert!(meta.is_dir());
            assert_eq!(meta.permissions().mode() & 0o777, 0o700, "{}", dir.display());
        }

        // Idempotent on existing directories.
        paths.ensure_dirs().unwrap();
    }
}
