//! Private key file ownership and permission checks.
//!
//! A key file is trusted only when nobody but its owner can read it, with one
//! relaxation: a root-owned key may be group-readable so that a system-wide
//! certificate group can share it with the server.
//!
//! | owner          | allowed mode |
//! |----------------|--------------|
//! | server user    | 0600 or less |
//! | root           | 0640 or less |
//! | anyone else    | rejected     |

use std::fs;
use std::path::Path;

use crate::error::{Result, SecureError, Severity};
use crate::observability::metrics;

/// Group and world bits a server-owned key must not carry.
#[cfg(unix)]
const SELF_OWNED_FORBIDDEN: u32 = 0o077;

/// Bits a root-owned key must not carry: group write/execute and any world access.
#[cfg(unix)]
const ROOT_OWNED_FORBIDDEN: u32 = 0o020 | 0o010 | 0o007;

/// Check the key file at `path`, reporting any problem at the level matching
/// `is_server_start`. Returns whether the key may be loaded.
pub fn validate_key_file(path: &Path, is_server_start: bool) -> bool {
    match check_key_file(path) {
        Ok(()) => true,
        Err(e) => {
            metrics::record_key_file_rejected(rejection_reason(&e));
            Severity::for_server_start(is_server_start).report(&e, "Private key file rejected");
            false
        }
    }
}

/// Run every check on the key file at `path`.
pub fn check_key_file(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path).map_err(|source| SecureError::KeyFileAccess {
        path: path.to_path_buf(),
        source,
    })?;

    if !metadata.is_file() {
        return Err(SecureError::KeyFileNotRegular {
            path: path.to_path_buf(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        check_ownership_and_mode(path, metadata.uid(), metadata.mode(), effective_uid())?;
    }

    Ok(())
}

/// Ownership and mode rules, separated from the filesystem.
#[cfg(unix)]
pub fn check_ownership_and_mode(path: &Path, owner: u32, mode: u32, euid: u32) -> Result<()> {
    if owner != euid && owner != 0 {
        return Err(SecureError::KeyFileOwner {
            path: path.to_path_buf(),
            owner,
        });
    }

    let mode = mode & 0o7777;
    let too_open = (owner == euid && mode & SELF_OWNED_FORBIDDEN != 0)
        || (owner == 0 && mode & ROOT_OWNED_FORBIDDEN != 0);
    if too_open {
        return Err(SecureError::KeyFilePermissions {
            path: path.to_path_buf(),
            mode,
        });
    }

    Ok(())
}

#[cfg(unix)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

fn rejection_reason(err: &SecureError) -> &'static str {
    match err {
        SecureError::KeyFileAccess { .. } => "access",
        SecureError::KeyFileNotRegular { .. } => "not_regular",
        SecureError::KeyFileOwner { .. } => "owner",
        SecureError::KeyFilePermissions { .. } => "permissions",
        _ => "other",
    }
}
