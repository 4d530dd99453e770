//! Structural validation of uploaded archives.
//!
//! Module archives are gzipped tarballs decoded in a blocking task with a
//! bounded read budget; validation walks every entry without materializing
//! the tree. Provider archives are opaque zip files checked for magic and
//! naming only, since their contents are platform binaries.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use std::io::Read;
use std::path::Component;
use std::sync::LazyLock;

/// Total uncompressed cap for module archives.
pub const MODULE_MAX_UNCOMPRESSED: u64 = 100 * 1024 * 1024;
/// Total cap for provider platform archives.
pub const PROVIDER_MAX_BYTES: u64 = 500 * 1024 * 1024;
/// README bytes cached in metadata.
pub const README_MAX_BYTES: u64 = 1024 * 1024;
/// Manifest entry embedded into SCM-published archives.
pub const COMMIT_MANIFEST_PATH: &str = ".registry/commit";

static README_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^README(\.md|\.txt)?$").expect("valid regex"));

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Not a well-formed gzipped tarball.
    #[error("malformed_archive")]
    Malformed,
    /// Entry path escapes the root, is absolute, or is otherwise banned.
    #[error("unsafe_path: {0}")]
    UnsafePath(String),
    /// Uncompressed content exceeds the size cap.
    #[error("archive exceeds size limit")]
    TooLarge,
}

/// What a validation pass learned about an archive.
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub uncompressed_size: u64,
    pub entry_count: usize,
    /// First root-level README match, capped at [`README_MAX_BYTES`].
    pub readme: Option<String>,
}

/// Validate a gzipped tarball and extract its README.
///
/// Rules enforced per entry: no `..` components, no absolute paths, no
/// `.git/` content, no symlinks or hardlinks. The `max_uncompressed`
/// parameter is the total cap; callers pass [`MODULE_MAX_UNCOMPRESSED`] in
/// production and smaller budgets in tests.
pub fn inspect_tarball(data: &[u8], max_uncompressed: u64) -> Result<ArchiveInfo, ArchiveError> {
    let decoder = GzDecoder::new(data);
    let mut archive = tar::Archive::new(decoder);

    let mut total: u64 = 0;
    let mut entry_count = 0usize;
    let mut readme: Option<String> = None;

    let entries = archive.entries().map_err(|_| ArchiveError::Malformed)?;
    for entry in entries {
        let mut entry = entry.map_err(|_| ArchiveError::Malformed)?;
        entry_count += 1;

        let path = entry.path().map_err(|_| ArchiveError::Malformed)?;
        let display = path.display().to_string();

        if path.is_absolute() {
            return Err(ArchiveError::UnsafePath(display));
        }
        for component in path.components() {
            match component {
                Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                    return Err(ArchiveError::UnsafePath(display));
                }
                Component::Normal(name) if name == ".git" => {
                    return Err(ArchiveError::UnsafePath(display));
                }
                _ => {}
            }
        }

        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            return Err(ArchiveError::UnsafePath(display));
        }

        total = total.saturating_add(entry.size());
        if total > max_uncompressed {
            return Err(ArchiveError::TooLarge);
        }

        if readme.is_none() && kind.is_file() && is_root_readme(&path) {
            let mut buf = Vec::new();
            entry
                .by_ref()
                .take(README_MAX_BYTES)
                .read_to_end(&mut buf)
                .map_err(|_| ArchiveError::Malformed)?;
            readme = Some(String::from_utf8_lossy(&buf).into_owned());
        } else {
            // Drain so header-declared sizes are actually present; a
            // truncated stream fails here instead of silently passing.
            std::io::copy(&mut entry, &mut std::io::sink())
                .map_err(|_| ArchiveError::Malformed)?;
        }
    }

    if entry_count == 0 {
        return Err(ArchiveError::Malformed);
    }

    Ok(ArchiveInfo {
        uncompressed_size: total,
        entry_count,
        readme,
    })
}

fn is_root_readme(path: &std::path::Path) -> bool {
    let mut components = path.components().filter(|c| {
        // `./README.md` counts as root-level.
        !matches!(c, Component::CurDir)
    });
    let Some(Component::Normal(name)) = components.next() else {
        return false;
    };
    if components.next().is_some() {
        return false;
    }
    name.to_str().is_some_and(|n| README_PATTERN.is_match(n))
}

/// Rebuild an SCM-fetched tarball for publication: strip the uniform root
/// prefix SCM archives carry, then embed the commit hash as a manifest
/// entry at [`COMMIT_MANIFEST_PATH`] so downloads are reproducible from the
/// commit.
pub fn rebuild_with_commit_manifest(
    data: &[u8],
    commit_sha: &str,
) -> Result<Vec<u8>, ArchiveError> {
    let decoder = GzDecoder::new(data);
    let mut archive = tar::Archive::new(decoder);

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let entries = archive.entries().map_err(|_| ArchiveError::Malformed)?;
    for entry in entries {
        let mut entry = entry.map_err(|_| ArchiveError::Malformed)?;
        let kind = entry.header().entry_type();
        if !kind.is_file() && !kind.is_dir() {
            continue;
        }
        let path = entry.path().map_err(|_| ArchiveError::Malformed)?;
        // SCM archives root every entry under `<repo>-<sha>/`.
        let stripped: std::path::PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|_| ArchiveError::Malformed)?;
        let mut header = entry.header().clone();
        header.set_size(contents.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, &stripped, contents.as_slice())
            .map_err(|_| ArchiveError::Malformed)?;
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(commit_sha.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, COMMIT_MANIFEST_PATH, commit_sha.as_bytes())
        .map_err(|_| ArchiveError::Malformed)?;

    let encoder = builder.into_inner().map_err(|_| ArchiveError::Malformed)?;
    encoder.finish().map_err(|_| ArchiveError::Malformed)
}

/// Zip local-file-header magic check for provider archives.
#[must_use]
pub fn looks_like_zip(data: &[u8]) -> bool {
    data.starts_with(b"PK\x03\x04")
}

static PROVIDER_FILENAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^terraform-provider-[a-z0-9-]+_v?\d+\.\d+\.\d+[\w.+-]*_[a-z0-9]+_[a-z0-9]+\.zip$")
        .expect("valid regex")
});

/// Validate the provider archive naming convention
/// `terraform-provider-<type>_<version>_<os>_<arch>.zip`; the `v` version
/// prefix some publishers use is tolerated.
#[must_use]
pub fn is_valid_provider_filename(filename: &str) -> bool {
    PROVIDER_FILENAME_PATTERN.is_match(filename)
}

#[cfg(test)]
pub(crate) mod test_archives {
    use super::*;

    /// Build a gzipped tarball from (path, contents) pairs.
    ///
    /// Writes the path bytes directly into the header rather than going
    /// through `Header::set_path`, since that validates against `..`
    /// components and these fixtures intentionally include unsafe paths
    /// to exercise the archive inspector's own rejection of them.
    pub fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            let name_field = &mut header.as_gnu_mut().unwrap().name;
            let path_bytes = path.as_bytes();
            name_field[..path_bytes.len()].copy_from_slice(path_bytes);
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// Build a tarball containing a symlink entry.
    pub fn tarball_with_symlink(link: &str, target: &str) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder.append_link(&mut header, link, target).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_archives::{tarball, tarball_with_symlink};
    use super::*;

    #[test]
    fn test_valid_module_archive() {
        let data = tarball(&[
            ("main.tf", b"resource {}".as_slice()),
            ("README.md", b"# VPC module".as_slice()),
            ("modules/sub/extra.tf", b"".as_slice()),
        ]);
        let info = inspect_tarball(&data, MODULE_MAX_UNCOMPRESSED).unwrap();
        assert_eq!(info.entry_count, 3);
        assert_eq!(info.readme.as_deref(), Some("# VPC module"));
    }

    #[test]
    fn test_readme_match_is_case_insensitive_and_root_only() {
        let data = tarball(&[
            ("docs/README.md", b"nested".as_slice()),
            ("readme.txt", b"root".as_slice()),
        ]);
        let info = inspect_tarball(&data, MODULE_MAX_UNCOMPRESSED).unwrap();
        assert_eq!(info.readme.as_deref(), Some("root"));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            inspect_tarball(b"definitely not gzip", MODULE_MAX_UNCOMPRESSED),
            Err(ArchiveError::Malformed)
        ));
        // Valid gzip, not a tarball.
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let gz = {
            use std::io::Write;
            let mut encoder = encoder;
            encoder.write_all(b"plain text").unwrap();
            encoder.finish().unwrap()
        };
        assert!(inspect_tarball(&gz, MODULE_MAX_UNCOMPRESSED).is_err());
    }

    #[test]
    fn test_traversal_rejected() {
        let data = tarball(&[("../escape.tf", b"".as_slice())]);
        assert!(matches!(
            inspect_tarball(&data, MODULE_MAX_UNCOMPRESSED),
            Err(ArchiveError::UnsafePath(_))
        ));
    }

    #[test]
    fn test_git_directory_rejected() {
        let data = tarball(&[(".git/config", b"".as_slice())]);
        assert!(matches!(
            inspect_tarball(&data, MODULE_MAX_UNCOMPRESSED),
            Err(ArchiveError::UnsafePath(_))
        ));
    }

    #[test]
    fn test_symlink_rejected() {
        let data = tarball_with_symlink("link.tf", "../../etc/passwd");
        assert!(matches!(
            inspect_tarball(&data, MODULE_MAX_UNCOMPRESSED),
            Err(ArchiveError::UnsafePath(_))
        ));
    }

    #[test]
    fn test_size_cap_is_exact() {
        let body = vec![0u8; 1024];
        let data = tarball(&[("blob.bin", body.as_slice())]);
        // Exactly at the cap succeeds.
        assert!(inspect_tarball(&data, 1024).is_ok());
        // One byte under the cap fails.
        assert!(matches!(
            inspect_tarball(&data, 1023),
            Err(ArchiveError::TooLarge)
        ));
    }

    #[test]
    fn test_rebuild_strips_prefix_and_adds_manifest() {
        let commit = "a".repeat(40);
        let data = tarball(&[
            ("repo-abc123/main.tf", b"resource {}".as_slice()),
            ("repo-abc123/README.md", b"docs".as_slice()),
        ]);
        let rebuilt = rebuild_with_commit_manifest(&data, &commit).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(rebuilt.as_slice()));
        let mut found = std::collections::HashMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            found.insert(path, contents);
        }
        assert_eq!(found.get("main.tf").map(String::as_str), Some("resource {}"));
        assert_eq!(
            found.get(COMMIT_MANIFEST_PATH).map(String::as_str),
            Some(commit.as_str())
        );
        assert!(!found.keys().any(|k| k.starts_with("repo-abc123")));
    }

    #[test]
    fn test_provider_filename_convention() {
        assert!(is_valid_provider_filename(
            "terraform-provider-random_v3.6.0_linux_amd64.zip"
        ));
        assert!(is_valid_provider_filename(
            "terraform-provider-aws_v5.31.0-beta1_darwin_arm64.zip"
        ));
        // Upstream registries publish without the v prefix.
        assert!(is_valid_provider_filename(
            "terraform-provider-random_3.6.0_linux_amd64.zip"
        ));
        assert!(!is_valid_provider_filename("random_v3.6.0_linux_amd64.zip"));
        assert!(!is_valid_provider_filename(
            "terraform-provider-random_v3.6.0_linux_amd64.tar.gz"
        ));
    }

    #[test]
    fn test_zip_magic() {
        assert!(looks_like_zip(b"PK\x03\x04rest"));
        assert!(!looks_like_zip(b"\x1f\x8bgzip"));
    }
}
