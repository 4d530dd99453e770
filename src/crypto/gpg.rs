//! # GPG Signature Verification
//!
//! Verifies the detached ASCII-armored signature over an upstream provider's
//! SHA256SUMS manifest against the version's declared public key.
//!
//! Verification shells out to the system `gpg` binary with a throwaway
//! keyring per call. The binary is located via `which`; absence is a hard
//! error for mirrors that require verification.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Seam for signature verification so the mirror engine can be exercised
/// without a gpg binary on the test host.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Returns Ok(()) when `signature` is a valid detached signature over
    /// `data` by the key in `armored_public_key`.
    async fn verify_detached(
        &self,
        armored_public_key: &str,
        data: &[u8],
        signature: &[u8],
    ) -> Result<()>;
}

/// Production verifier backed by the system `gpg` binary.
#[derive(Debug, Default)]
pub struct GpgCliVerifier;

impl GpgCliVerifier {
    fn locate_gpg() -> Result<PathBuf> {
        which::which("gpg").context("gpg binary not found on PATH; required for mirror signature verification")
    }
}

#[async_trait]
impl SignatureVerifier for GpgCliVerifier {
    async fn verify_detached(
        &self,
        armored_public_key: &str,
        data: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let gpg_path = Self::locate_gpg()?;

        // Throwaway keyring; nothing leaks into the operator's GNUPGHOME.
        let gpg_home = tempfile::Builder::new()
            .prefix(&format!("registry-gpg-{}", uuid::Uuid::new_v4()))
            .tempdir()
            .context("failed to create temporary GPG home")?;
        debug!(gpg_home = ?gpg_home.path(), "created temporary GPG home");

        let mut import = tokio::process::Command::new(&gpg_path)
            .env("GNUPGHOME", gpg_home.path())
            .arg("--batch")
            .arg("--yes")
            .arg("--import")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn gpg import")?;

        if let Some(mut stdin) = import.stdin.take() {
            stdin
                .write_all(armored_public_key.as_bytes())
                .await
                .context("failed to write public key to gpg stdin")?;
            stdin.shutdown().await.context("failed to close gpg stdin")?;
        }

        let output = import
            .wait_with_output()
            .await
            .context("failed to wait for gpg import")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gpg key import failed: {}", stderr.trim());
        }

        let data_path = gpg_home.path().join("manifest");
        let sig_path = gpg_home.path().join("manifest.sig");
        tokio::fs::write(&data_path, data)
            .await
            .context("failed to write manifest for verification")?;
        tokio::fs::write(&sig_path, signature)
            .await
            .context("failed to write signature for verification")?;

        let verify = tokio::process::Command::new(&gpg_path)
            .env("GNUPGHOME", gpg_home.path())
            .arg("--batch")
            .arg("--verify")
            .arg(&sig_path)
            .arg(&data_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to run gpg verify")?;

        if !verify.status.success() {
            let stderr = String::from_utf8_lossy(&verify.stderr);
            warn!(stderr = %stderr.trim(), "gpg signature verification failed");
            bail!("signature verification failed");
        }
        Ok(())
    }
}
