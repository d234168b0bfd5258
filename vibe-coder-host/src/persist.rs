//! Atomic persistence for host identity and secrets.
//!
//! Three files live under the workspace directory, each permission 0600:
//! `.vibe-coder-host-id`, `.vibe-coder-totp-secret`, `.vibe-coder-session-secret`.
//! Every write goes through write-to-tmp, fsync, rename — mirroring the
//! teacher's atomic-config-write helper in the reference server.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use vibe_coder_proto::{ids, token, totp};

const HOST_ID_FILE: &str = ".vibe-coder-host-id";
const TOTP_SECRET_FILE: &str = ".vibe-coder-totp-secret";
const SESSION_SECRET_FILE: &str = ".vibe-coder-session-secret";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("workspace path {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Host identity plus its two secrets, as persisted on disk.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    pub host_id: String,
    pub totp_secret: String,
    pub session_secret: String,
}

fn atomic_write(path: &Path, contents: &str) -> Result<(), PersistError> {
    let tmp_path = path.with_extension("tmp");
    let mut file = File::create(&tmp_path).map_err(|source| PersistError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    file.write_all(contents.as_bytes())
        .map_err(|source| PersistError::Write {
            path: tmp_path.clone(),
            source,
        })?;
    file.set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(|source| PersistError::Write {
            path: tmp_path.clone(),
            source,
        })?;
    file.sync_all().map_err(|source| PersistError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| PersistError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn read_trimmed(path: &Path) -> Result<Option<String>, PersistError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PersistError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Load the persisted host identity, generating and persisting a fresh one
/// on first run (any of the three files missing counts as "first run").
pub fn load_or_create(workspace: &str) -> Result<HostIdentity, PersistError> {
    let dir = Path::new(workspace);
    if dir.exists() && !dir.is_dir() {
        return Err(PersistError::NotADirectory(dir.to_path_buf()));
    }
    fs::create_dir_all(dir).map_err(|source| PersistError::Write {
        path: dir.to_path_buf(),
        source,
    })?;

    let host_id_path = dir.join(HOST_ID_FILE);
    let totp_path = dir.join(TOTP_SECRET_FILE);
    let session_path = dir.join(SESSION_SECRET_FILE);

    let host_id = match read_trimmed(&host_id_path)? {
        Some(id) if !id.is_empty() => id,
        _ => {
            let id = ids::generate_host_id();
            atomic_write(&host_id_path, &id)?;
            id
        }
    };

    let totp_secret = match read_trimmed(&totp_path)? {
        Some(secret) if totp::validate_secret(&secret).is_ok() => secret,
        _ => {
            let secret = totp::generate_secret();
            atomic_write(&totp_path, &secret)?;
            secret
        }
    };

    let session_secret = match read_trimmed(&session_path)? {
        Some(secret) if secret.len() >= 32 => secret,
        _ => {
            let secret = token::generate_session_secret();
            atomic_write(&session_path, &secret)?;
            secret
        }
    };

    Ok(HostIdentity {
        host_id,
        totp_secret,
        session_secret,
    })
}

/// Generate and persist a brand new host identity, overwriting all three
/// files. Used by `renewHostId` (spec.md §4.2) — an explicit administrative
/// action, never automatic.
pub fn renew(workspace: &str) -> Result<HostIdentity, PersistError> {
    let dir = Path::new(workspace);
    let host_id = ids::generate_host_id();
    let totp_secret = totp::generate_secret();
    let session_secret = token::generate_session_secret();

    atomic_write(&dir.join(HOST_ID_FILE), &host_id)?;
    atomic_write(&dir.join(TOTP_SECRET_FILE), &totp_secret)?;
    atomic_write(&dir.join(SESSION_SECRET_FILE), &session_secret)?;

    Ok(HostIdentity {
        host_id,
        totp_secret,
        session_secret,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_creates_all_three_files_with_0600_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let identity = load_or_create(path).unwrap();

        assert_eq!(identity.host_id.len(), 8);
        assert!(totp::validate_secret(&identity.totp_secret).is_ok());
        assert!(identity.session_secret.len() >= 32);

        for name in [HOST_ID_FILE, TOTP_SECRET_FILE, SESSION_SECRET_FILE] {
            let meta = fs::metadata(dir.path().join(name)).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        }
    }

    #[test]
    fn second_load_reuses_persisted_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let first = load_or_create(path).unwrap();
        let second = load_or_create(path).unwrap();
        assert_eq!(first.host_id, second.host_id);
        assert_eq!(first.totp_secret, second.totp_secret);
        assert_eq!(first.session_secret, second.session_secret);
    }

    #[test]
    fn renew_replaces_identity_and_is_visible_on_next_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let first = load_or_create(path).unwrap();
        let renewed = renew(path).unwrap();
        assert_ne!(first.host_id, renewed.host_id);

        let reloaded = load_or_create(path).unwrap();
        assert_eq!(reloaded.host_id, renewed.host_id);
    }
}
