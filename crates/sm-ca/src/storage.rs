//! File-backed storage for certificate artifacts.
//!
//! Certificates are world-readable (0644); private keys are owner-only
//! (0600). Readers open fresh handles each time.

use std::fs;
use std::path::{Path, PathBuf};

use crate::types::CaResult;

pub struct CaStorage {
    base_path: PathBuf,
}

impl CaStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn init(&self) -> CaResult<()> {
        fs::create_dir_all(&self.base_path)?;
        Ok(())
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.base_path.join("ca.crt")
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.base_path.join("ca.key")
    }

    pub fn server_cert_path(&self) -> PathBuf {
        self.base_path.join("server.crt")
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.base_path.join("server.key")
    }

    pub fn ca_exists(&self) -> bool {
        self.ca_cert_path().exists() && self.ca_key_path().exists()
    }

    pub fn server_cert_exists(&self) -> bool {
        self.server_cert_path().exists() && self.server_key_path().exists()
    }

    pub fn read_file<P: AsRef<Path>>(&self, path: P) -> CaResult<String> {
        Ok(fs::read_to_string(path.as_ref())?)
    }

    /// Write a certificate (mode 0644).
    pub fn write_cert_file<P: AsRef<Path>>(&self, path: P, content: &str) -> CaResult<()> {
        fs::write(path.as_ref(), content)?;
        set_mode(path.as_ref(), 0o644)?;
        Ok(())
    }

    /// Write a private key (mode 0600).
    pub fn write_key_file<P: AsRef<Path>>(&self, path: P, content: &str) -> CaResult<()> {
        fs::write(path.as_ref(), content)?;
        set_mode(path.as_ref(), 0o600)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> CaResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> CaResult<()> {
    Ok(())
}
