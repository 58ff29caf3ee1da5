use crate::engine::Platform;
use crate::error::{Error, Result};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tar::Archive;
use tracing::debug;
use url::Url;
use walkdir::WalkDir;
use xz2::read::XzDecoder;
use zip::ZipArchive;

use flate2::read::GzDecoder;

pub const DEFAULT_BASE_URL: &str = "https://releases.hashicorp.com/terraform";
const DEFAULT_USER_AGENT: &str = concat!("tfws/", env!("CARGO_PKG_VERSION"));

/// File names published for one release of a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseArtifacts {
    pub archive: String,
    pub checksums: String,
    pub signature: String,
}

impl ReleaseArtifacts {
    pub fn new(tool: &str, version: &str, platform: &Platform) -> Self {
        let checksums = format!("{tool}_{version}_SHA256SUMS");
        Self {
            archive: format!(
                "{tool}_{version}_{}_{}.zip",
                platform.os(),
                platform.arch()
            ),
            signature: format!("{checksums}.sig"),
            checksums,
        }
    }
}

/// Executable name of `tool` on `platform`.
pub fn binary_name(tool: &str, platform: &Platform) -> String {
    if platform.os() == "windows" {
        format!("{tool}.exe")
    } else {
        tool.to_string()
    }
}

#[derive(Clone)]
pub struct ReleaseClient {
    http: Client,
    base_url: String,
    user_agent: String,
}

impl ReleaseClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|err| Error::transfer(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        })
    }

    pub fn artifact_url(&self, version: &str, name: &str) -> Result<Url> {
        let raw = format!("{}/{version}/{name}", self.base_url);
        Url::parse(&raw).map_err(|err| Error::transfer(format!("invalid release URL {raw}: {err}")))
    }

    /// Download one artifact to `dest`, returning the SHA-256 of the bytes written.
    pub fn download(&self, version: &str, name: &str, dest: &Path) -> Result<[u8; 32]> {
        let url = self.artifact_url(version, name)?;
        debug!(url = %url, dest = ?dest, "downloading release artifact");

        if url.scheme() == "file" {
            let source = url
                .to_file_path()
                .map_err(|_| Error::transfer(format!("invalid file URL {url}")))?;
            let reader = File::open(&source)
                .map_err(|err| Error::transfer(format!("failed to open {source:?}: {err}")))?;
            return write_hashed(reader, url.as_str(), dest);
        }

        let response = self
            .http
            .get(url.clone())
            .header(USER_AGENT, &self.user_agent)
            .send()
            .map_err(|err| Error::transfer(format!("failed to download {url}: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(Error::transfer(format!(
                "download of {url} returned {status}: {}",
                body.trim()
            )));
        }

        write_hashed(response, url.as_str(), dest)
    }
}

fn write_hashed(mut reader: impl Read, source: &str, dest: &Path) -> Result<[u8; 32]> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
    }

    let temp_path = dest.with_extension("download");
    let mut file = File::create(&temp_path).map_err(|err| Error::io(&temp_path, err))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| Error::transfer(format!("failed while reading {source}: {err}")))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .map_err(|err| Error::io(&temp_path, err))?;
        hasher.update(&buffer[..read]);
    }

    file.flush().map_err(|err| Error::io(&temp_path, err))?;
    fs::rename(&temp_path, dest).map_err(|err| Error::io(dest, err))?;

    Ok(hasher.finalize().into())
}

/// Find the digest listed for `name` in a `SHA256SUMS` document.
pub fn parse_checksums(contents: &str, name: &str) -> Result<[u8; 32]> {
    let line = Regex::new(r"^([0-9a-fA-F]{64})\s+\*?(\S+)$")
        .map_err(|err| Error::transfer(format!("invalid checksum pattern: {err}")))?;

    for entry in contents.lines() {
        let Some(captures) = line.captures(entry.trim()) else {
            continue;
        };
        if &captures[2] != name {
            continue;
        }

        let bytes = hex::decode(&captures[1]).map_err(|err| {
            Error::transfer(format!("failed to decode checksum for {name}: {err}"))
        })?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes);
        return Ok(digest);
    }

    Err(Error::transfer(format!("no checksum listed for {name}")))
}

pub fn format_digest(bytes: &[u8; 32]) -> String {
    hex::encode(bytes)
}

pub fn compute_sha256(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path).map_err(|err| Error::io(path, err))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = file.read(&mut buffer).map_err(|err| Error::io(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().into())
}

/// Verify a detached signature with `gpg`, trusting only `key`.
///
/// The keyring lives in `home`, so the user's own keyring is never consulted.
pub fn verify_signature(
    key: &Path,
    signature: &Path,
    document: &Path,
    home: &Path,
) -> Result<()> {
    let gpg = which::which("gpg").map_err(|_| {
        Error::transfer("gpg is required to verify release signatures but was not found in PATH")
    })?;

    fs::create_dir_all(home).map_err(|err| Error::io(home, err))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(home, fs::Permissions::from_mode(0o700))
            .map_err(|err| Error::io(home, err))?;
    }

    let run = |args: &[&OsStr]| -> Result<()> {
        let output = Command::new(&gpg)
            .arg("--homedir")
            .arg(home)
            .arg("--batch")
            .args(args)
            .output()
            .map_err(|err| Error::io(&gpg, err))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::transfer(format!(
                "gpg {} failed: {}",
                args.first().map(|arg| arg.to_string_lossy()).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    };

    run(&[OsStr::new("--import"), key.as_os_str()])?;
    run(&[
        OsStr::new("--verify"),
        signature.as_os_str(),
        document.as_os_str(),
    ])?;
    debug!(document = ?document, "signature verified");
    Ok(())
}

pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let filename = archive_path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let open = || File::open(archive_path).map_err(|err| Error::io(archive_path, err));
    let unpack_failed =
        |err: io::Error| Error::transfer(format!("failed to unpack {archive_path:?}: {err}"));

    if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
        Archive::new(GzDecoder::new(open()?))
            .unpack(dest)
            .map_err(unpack_failed)?;
    } else if filename.ends_with(".tar.xz") || filename.ends_with(".txz") {
        Archive::new(XzDecoder::new(open()?))
            .unpack(dest)
            .map_err(unpack_failed)?;
    } else if filename.ends_with(".tar") {
        Archive::new(open()?).unpack(dest).map_err(unpack_failed)?;
    } else if filename.ends_with(".zip") {
        let mut archive = ZipArchive::new(open()?).map_err(|err| {
            Error::transfer(format!("failed to read zip archive {archive_path:?}: {err}"))
        })?;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|err| {
                Error::transfer(format!(
                    "failed to read zip entry #{index} from {archive_path:?}: {err}"
                ))
            })?;

            let Some(enclosed) = entry.enclosed_name().map(|path| dest.join(path)) else {
                continue;
            };

            if entry.name().ends_with('/') {
                fs::create_dir_all(&enclosed).map_err(|err| Error::io(&enclosed, err))?;
                continue;
            }

            if let Some(parent) = enclosed.parent() {
                fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
            }
            let mut outfile = File::create(&enclosed).map_err(|err| Error::io(&enclosed, err))?;
            io::copy(&mut entry, &mut outfile).map_err(unpack_failed)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    fs::set_permissions(&enclosed, fs::Permissions::from_mode(mode))
                        .map_err(|err| Error::io(&enclosed, err))?;
                }
            }
        }
    } else {
        let name = archive_path
            .file_name()
            .ok_or_else(|| Error::transfer("archive path is missing a file name"))?;
        let target = dest.join(name);
        fs::copy(archive_path, &target).map_err(|err| Error::io(&target, err))?;
    }

    Ok(())
}

/// Locate `name` inside extracted contents, directly or by a unique file-name match.
pub fn resolve_binary_path(extract_root: &Path, name: &str) -> Result<PathBuf> {
    let direct = extract_root.join(name);
    if direct.is_file() {
        return Ok(direct);
    }

    let mut matches = Vec::new();
    for entry in WalkDir::new(extract_root) {
        let entry = entry.map_err(|err| Error::transfer(err.to_string()))?;
        if entry.file_type().is_file() && entry.file_name() == name {
            matches.push(entry.into_path());
            if matches.len() > 1 {
                break;
            }
        }
    }

    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(Error::transfer(format!(
            "binary '{name}' not found in extracted contents under {extract_root:?}"
        ))),
        _ => Err(Error::transfer(format!(
            "binary '{name}' matched multiple files under {extract_root:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::{CompressionMethod, ZipWriter};

    const HELLO_DIGEST: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[rstest]
    #[case("linux", "amd64", "terraform_1.9.0_linux_amd64.zip")]
    #[case("darwin", "arm64", "terraform_1.9.0_darwin_arm64.zip")]
    #[case("windows", "386", "terraform_1.9.0_windows_386.zip")]
    fn test_artifact_names(#[case] os: &str, #[case] arch: &str, #[case] archive: &str) {
        let artifacts = ReleaseArtifacts::new("terraform", "1.9.0", &Platform::new(os, arch));
        assert_eq!(artifacts.archive, archive);
        assert_eq!(artifacts.checksums, "terraform_1.9.0_SHA256SUMS");
        assert_eq!(artifacts.signature, "terraform_1.9.0_SHA256SUMS.sig");
    }

    #[test]
    fn binary_name_on_windows_has_extension() {
        assert_eq!(binary_name("terraform", &Platform::new("windows", "amd64")), "terraform.exe");
        assert_eq!(binary_name("terraform", &Platform::new("linux", "amd64")), "terraform");
    }

    #[test]
    fn artifact_url_joins_base_and_version() {
        let client = ReleaseClient::new("https://releases.example.com/terraform/").unwrap();
        let url = client.artifact_url("1.9.0", "terraform_1.9.0_SHA256SUMS").unwrap();
        assert_eq!(
            url.as_str(),
            "https://releases.example.com/terraform/1.9.0/terraform_1.9.0_SHA256SUMS"
        );
    }

    #[test]
    fn parse_checksums_finds_entry() {
        let sums = format!(
            "{} terraform_1.9.0_darwin_arm64.zip\n\
             {HELLO_DIGEST}  terraform_1.9.0_linux_amd64.zip\n",
            "0".repeat(64)
        );
        let digest = parse_checksums(&sums, "terraform_1.9.0_linux_amd64.zip").unwrap();
        assert_eq!(format_digest(&digest), HELLO_DIGEST);
    }

    #[test]
    fn parse_checksums_missing_entry_is_transfer_error() {
        let err = parse_checksums("garbage\n", "terraform_1.9.0_linux_amd64.zip").unwrap_err();
        assert!(matches!(err, Error::Transfer(_)));
        assert!(err.to_string().contains("no checksum listed"));
    }

    #[test]
    fn download_from_file_url_hashes_contents() {
        let temp = TempDir::new().unwrap();
        let mirror = temp.path().join("mirror/1.9.0");
        fs::create_dir_all(&mirror).unwrap();
        fs::write(mirror.join("artifact"), b"hello world").unwrap();

        let base = Url::from_directory_path(temp.path().join("mirror")).unwrap();
        let client = ReleaseClient::new(base.as_str()).unwrap();
        let dest = temp.path().join("downloads/artifact");
        let digest = client.download("1.9.0", "artifact", &dest).unwrap();

        assert_eq!(format_digest(&digest), HELLO_DIGEST);
        assert_eq!(fs::read(&dest).unwrap(), b"hello world");
    }

    #[test]
    fn download_missing_file_is_transfer_error() {
        let temp = TempDir::new().unwrap();
        let base = Url::from_directory_path(temp.path()).unwrap();
        let client = ReleaseClient::new(base.as_str()).unwrap();
        let err = client
            .download("1.9.0", "missing", &temp.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(_)));
    }

    #[test]
    fn extract_zip_and_resolve_binary() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("terraform_1.9.0_linux_amd64.zip");
        {
            let mut writer = ZipWriter::new(File::create(&archive).unwrap());
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Stored)
                .unix_permissions(0o755);
            writer.start_file("terraform", options).unwrap();
            writer.write_all(b"#!/bin/sh\n").unwrap();
            writer.finish().unwrap();
        }

        let dest = temp.path().join("extract");
        fs::create_dir_all(&dest).unwrap();
        extract_archive(&archive, &dest).unwrap();

        let binary = resolve_binary_path(&dest, "terraform").unwrap();
        assert_eq!(fs::read(&binary).unwrap(), b"#!/bin/sh\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&binary).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn extract_tar_gz_nested_binary() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("tool.tar.gz");
        {
            let encoder = flate2::write::GzEncoder::new(
                File::create(&archive).unwrap(),
                flate2::Compression::default(),
            );
            let mut builder = tar::Builder::new(encoder);
            let mut header = tar::Header::new_gnu();
            header.set_size(4);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, "release/bin/terraform", &b"bin\n"[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = temp.path().join("extract");
        fs::create_dir_all(&dest).unwrap();
        extract_archive(&archive, &dest).unwrap();

        let binary = resolve_binary_path(&dest, "terraform").unwrap();
        assert!(binary.ends_with("release/bin/terraform"));
    }

    #[test]
    fn resolve_binary_path_missing_errors() {
        let temp = TempDir::new().unwrap();
        let err = resolve_binary_path(temp.path(), "terraform").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn compute_sha256_matches_known_digest() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("file");
        fs::write(&file, b"hello world").unwrap();
        let digest = compute_sha256(&file).unwrap();
        assert_eq!(format_digest(&digest), HELLO_DIGEST);
    }
}
