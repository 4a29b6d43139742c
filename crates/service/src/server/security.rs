//! Local-socket hardening: socket-parent validation at bind time and
//! same-user peer checks on every accepted connection.

use anyhow::{bail, Context, Result};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tokio::net::UnixStream;

/// Validate the socket's parent directory before binding. The directory
/// must exist, must not be a symlink, must be owned by the current user,
/// and must not be group- or world-writable. Violation is fatal.
pub fn validate_socket_parent(socket_path: &Path) -> Result<()> {
    let dir = socket_path
        .parent()
        .context("socket path has no parent directory")?;

    // symlink_metadata so a symlinked parent is seen as such.
    let meta = std::fs::symlink_metadata(dir)
        .with_context(|| format!("failed to stat socket directory {}", dir.display()))?;

    if meta.file_type().is_symlink() {
        bail!("socket directory {} is a symlink", dir.display());
    }
    if !meta.is_dir() {
        bail!("socket parent path {} is not a directory", dir.display());
    }

    let current_uid = unsafe { libc::getuid() };
    if meta.uid() != current_uid {
        bail!(
            "socket directory {} is owned by UID {}, expected {}",
            dir.display(),
            meta.uid(),
            current_uid
        );
    }

    let mode = meta.mode() & 0o777;
    if mode & 0o022 != 0 {
        bail!(
            "socket directory {} has insecure permissions (mode {:04o})",
            dir.display(),
            mode
        );
    }

    Ok(())
}

/// Verify the connecting peer runs as the same user. Platforms where peer
/// credentials are unavailable fall back to filesystem permissions; that
/// fallback is logged.
pub fn verify_peer(stream: &UnixStream) -> std::result::Result<(), String> {
    match stream.peer_cred() {
        Ok(cred) => {
            let server_uid = unsafe { libc::getuid() };
            if cred.uid() != server_uid {
                return Err(format!(
                    "peer UID {} does not match server UID {server_uid}",
                    cred.uid()
                ));
            }
            Ok(())
        }
        Err(err) => {
            log::warn!(
                "peer credentials unavailable ({err}); relying on socket file permissions"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn accepts_owned_private_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("service");
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();

        validate_socket_parent(&dir.join("socket")).unwrap();
    }

    #[test]
    fn rejects_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let err = validate_socket_parent(&tmp.path().join("absent/socket")).unwrap_err();
        assert!(err.to_string().contains("failed to stat"));
    }

    #[test]
    fn rejects_symlinked_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let real = tmp.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = validate_socket_parent(&link.join("socket")).unwrap_err();
        assert!(err.to_string().contains("symlink"));
    }

    #[test]
    fn rejects_group_or_world_writable_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("loose");
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o775)).unwrap();

        let err = validate_socket_parent(&dir.join("socket")).unwrap_err();
        assert!(err.to_string().contains("insecure permissions"));
    }

    #[test]
    fn rejects_file_as_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let err = validate_socket_parent(&file.join("socket")).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[tokio::test]
    async fn same_user_peer_is_accepted() {
        let (a, _b) = UnixStream::pair().unwrap();
        verify_peer(&a).unwrap();
    }
}
