//! Base image provisioning and per-instance disk files.
//!
//! The store keeps everything under the configured disk directory:
//!
//! ```text
//! <disk_dir>/
//! ├── <kernel>                          # unpacked guest kernel
//! ├── <disk-image>                      # upstream qcow2 (compressed)
//! ├── <disk-image>_decompressed.<ext>   # boot disk base, resized
//! ├── <SHA256SUMS>_kernel               # upstream checksum snapshots
//! ├── <SHA256SUMS>_image
//! ├── ruleset.nft
//! └── .instance_data/
//!     ├── pool<i>.img                   # copy-on-write overlay
//!     ├── pool<i>_userdata.img          # FAT32 CIDATA volume
//!     └── pool<i>_console               # optional virtio console capture
//! ```
//!
//! Image refresh is idempotent: the upstream SHA256SUMS file is fetched and
//! the artifact is only re-downloaded when its local digest no longer
//! matches. Decompression and resize always run afterwards, because the
//! hypervisor cannot boot the compressed upstream qcow2 directly.

use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{ImageError, Result};

const KERNEL_SHA256SUMS_URL: &str =
    "https://cloud-images.ubuntu.com/daily/server/noble/current/unpacked/SHA256SUMS";
const DISK_SHA256SUMS_URL: &str =
    "https://cloud-images.ubuntu.com/daily/server/noble/current/SHA256SUMS";

/// Subdirectory for per-instance files, wiped on prebuild.
pub const INSTANCE_DATA_DIR: &str = ".instance_data";

const DECOMPRESSED_SUFFIX: &str = "_decompressed";

/// Disk-image tool: must support `convert`, `resize`, and `create -b`.
pub const QEMU_IMG_BIN: &str = "qemu-img";

/// Hard per-request download timeout. Downloads are never retried; recovery
/// is the caller's decision.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Maps the host architecture onto the upstream image naming scheme.
fn upstream_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn disk_image_url() -> String {
    format!(
        "https://cloud-images.ubuntu.com/daily/server/noble/current/noble-server-cloudimg-{}.img",
        upstream_arch()
    )
}

fn kernel_url() -> String {
    format!(
        "https://cloud-images.ubuntu.com/daily/server/noble/current/unpacked/noble-server-cloudimg-{}-vmlinuz-generic",
        upstream_arch()
    )
}

/// Provisioner for the shared base images and the per-instance file layout.
pub struct ImageStore {
    disk_dir: PathBuf,
    disk_size_gb: u64,
    qemu_img_bin: String,
    client: reqwest::Client,
}

impl ImageStore {
    /// Creates a store rooted at `disk_dir`, resizing boot disks to
    /// `disk_size_gb`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(disk_dir: impl Into<PathBuf>, disk_size_gb: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;

        Ok(Self {
            disk_dir: disk_dir.into(),
            disk_size_gb,
            qemu_img_bin: QEMU_IMG_BIN.to_string(),
            client,
        })
    }

    /// Overrides the disk-image tool binary.
    #[must_use]
    pub fn with_qemu_img(mut self, bin: impl Into<String>) -> Self {
        self.qemu_img_bin = bin.into();
        self
    }

    /// Directory holding per-instance files.
    #[must_use]
    pub fn instance_data_dir(&self) -> PathBuf {
        self.disk_dir.join(INSTANCE_DATA_DIR)
    }

    /// Path of the guest kernel.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream URL has no file name.
    pub fn kernel_path(&self) -> Result<PathBuf> {
        Ok(self.disk_dir.join(filename_from_url(&kernel_url())?))
    }

    /// Path of the upstream (compressed) disk image.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream URL has no file name.
    pub fn base_image_path(&self) -> Result<PathBuf> {
        Ok(self.disk_dir.join(filename_from_url(&disk_image_url())?))
    }

    /// Path of the decompressed, resized boot disk base.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream URL has no file name.
    pub fn decompressed_image_path(&self) -> Result<PathBuf> {
        Ok(add_suffix(&self.base_image_path()?, DECOMPRESSED_SUFFIX))
    }

    /// Overlay disk path for the named instance.
    #[must_use]
    pub fn overlay_path(&self, instance: &str) -> PathBuf {
        self.instance_data_dir().join(format!("{instance}.img"))
    }

    /// User-data image path for the named instance.
    #[must_use]
    pub fn userdata_path(&self, instance: &str) -> PathBuf {
        self.instance_data_dir().join(format!("{instance}_userdata.img"))
    }

    /// Console capture path for the named instance.
    #[must_use]
    pub fn console_path(&self, instance: &str) -> PathBuf {
        self.instance_data_dir().join(format!("{instance}_console"))
    }

    /// Removes and recreates the per-instance directory (mode `0700`).
    ///
    /// Loss of prior per-instance files is intentional: this only runs while
    /// the pool is empty, before the first VM boots.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be recreated.
    pub fn prepare_workdir(&self) -> Result<()> {
        let dir = self.instance_data_dir();

        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)?;
        Ok(())
    }

    /// Ensures the kernel and boot disk base are present and current.
    ///
    /// For each artifact the upstream SHA256SUMS is consulted and the
    /// download skipped when the local digest matches. The boot disk is then
    /// unconditionally decompressed (`convert -f qcow2 -O qcow2`) and resized
    /// to the configured size. Any failure is fatal to the caller; nothing is
    /// retried here.
    ///
    /// # Errors
    ///
    /// Returns an error on download, checksum, or tool failure.
    pub async fn ensure_images(&self) -> Result<()> {
        tracing::info!("checking for OS image updates");

        self.refresh_artifact(&kernel_url(), KERNEL_SHA256SUMS_URL, "_kernel")
            .await?;
        let base = self
            .refresh_artifact(&disk_image_url(), DISK_SHA256SUMS_URL, "_image")
            .await?;

        let decompressed = self.decompressed_image_path()?;

        tracing::info!(image = %base.display(), "decompressing disk image");
        self.run_qemu_img(&[
            "convert",
            "-f",
            "qcow2",
            "-O",
            "qcow2",
            &base.to_string_lossy(),
            &decompressed.to_string_lossy(),
        ])
        .await?;

        tracing::info!(size_gb = self.disk_size_gb, "resizing disk image");
        self.run_qemu_img(&[
            "resize",
            &decompressed.to_string_lossy(),
            &format!("{}G", self.disk_size_gb),
        ])
        .await?;

        Ok(())
    }

    /// Creates a fresh copy-on-write overlay against the decompressed base.
    ///
    /// # Errors
    ///
    /// Returns an error if the disk-image tool fails.
    pub async fn create_overlay(&self, instance: &str) -> Result<PathBuf> {
        let base = self.decompressed_image_path()?;
        let overlay = self.overlay_path(instance);

        self.run_qemu_img(&[
            "create",
            "-b",
            &base.to_string_lossy(),
            "-f",
            "qcow2",
            "-F",
            "qcow2",
            &overlay.to_string_lossy(),
        ])
        .await?;

        Ok(overlay)
    }

    /// Returns true when the disk-image tool can be invoked.
    #[must_use]
    pub fn qemu_img_available(&self) -> bool {
        std::process::Command::new(&self.qemu_img_bin)
            .arg("--version")
            .output()
            .is_ok()
    }

    /// Downloads `url`, skipping when the local file already matches the
    /// upstream checksum. Returns the artifact path.
    async fn refresh_artifact(&self, url: &str, sums_url: &str, tag: &str) -> Result<PathBuf> {
        let name = filename_from_url(url)?;
        let target = self.disk_dir.join(&name);

        let mut download_needed = true;
        if target.exists() {
            let sums_name = filename_from_url(sums_url)?;
            let sums_path = self.disk_dir.join(format!("{sums_name}{tag}"));
            self.download(sums_url, &sums_path).await?;

            let sums = std::fs::read_to_string(&sums_path)?;
            let upstream = checksum_for(&sums, &name).ok_or_else(|| {
                ImageError::Checksum(format!("no entry for {name} in {sums_name}"))
            })?;
            let local = sha256_file(&target)?;

            if local == upstream {
                tracing::info!(artifact = %name, "image is up-to-date");
                download_needed = false;
            }
        }

        if download_needed {
            tracing::info!(artifact = %name, "downloading");
            self.download(url, &target).await?;
            tracing::info!(artifact = %name, "download done");
        }

        Ok(target)
    }

    async fn download(&self, url: &str, target: &Path) -> Result<()> {
        let mut response = self.client.get(url).send().await?.error_for_status()?;

        let mut file = tokio::fs::File::create(target).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn run_qemu_img(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.qemu_img_bin).args(args).output().await?;

        if !output.status.success() {
            return Err(ImageError::Convert(format!(
                "{} {} failed: {}",
                self.qemu_img_bin,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Returns the last path segment of a URL.
pub(crate) fn filename_from_url(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ImageError::Url(e.to_string()))?;
    parsed
        .path_segments()
        .and_then(|segments| segments.last())
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| ImageError::Url(format!("no file name in {url}")))
}

/// Inserts `suffix` before the file extension:
/// `base.img` + `_decompressed` → `base_decompressed.img`.
pub(crate) fn add_suffix(path: &Path, suffix: &str) -> PathBuf {
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let stem = path.with_extension("");

    match ext {
        Some(ext) => PathBuf::from(format!("{}{}.{}", stem.display(), suffix, ext)),
        None => PathBuf::from(format!("{}{}", stem.display(), suffix)),
    }
}

/// Finds a file's digest in SHA256SUMS contents. Lines have the form
/// `<digest> *<name>`.
pub(crate) fn checksum_for(sums: &str, filename: &str) -> Option<String> {
    let wanted = format!(" *{filename}");
    sums.lines()
        .map(str::trim)
        .find(|line| line.ends_with(&wanted))
        .and_then(|line| line.split(' ').next())
        .map(ToOwned::to_owned)
}

/// Streams a file through SHA-256 and returns the lowercase hex digest.
pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn filename_from_url_takes_last_segment() {
        assert_eq!(
            filename_from_url("https://example.com/a/b/image.img").unwrap(),
            "image.img"
        );
        assert_eq!(
            filename_from_url("https://example.com/SHA256SUMS").unwrap(),
            "SHA256SUMS"
        );
        assert!(filename_from_url("https://example.com/").is_err());
    }

    #[test]
    fn add_suffix_preserves_extension() {
        assert_eq!(
            add_suffix(Path::new("/x/base.img"), "_decompressed"),
            PathBuf::from("/x/base_decompressed.img")
        );
        assert_eq!(
            add_suffix(Path::new("/x/vmlinuz"), "_decompressed"),
            PathBuf::from("/x/vmlinuz_decompressed")
        );
    }

    #[test]
    fn checksum_lookup_matches_star_prefixed_names() {
        let sums = "\
abc123 *noble-server-cloudimg-amd64.img
def456 *noble-server-cloudimg-arm64.img
";
        assert_eq!(
            checksum_for(sums, "noble-server-cloudimg-amd64.img").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            checksum_for(sums, "noble-server-cloudimg-arm64.img").as_deref(),
            Some("def456")
        );
        assert!(checksum_for(sums, "missing.img").is_none());
    }

    #[test]
    fn checksum_lookup_does_not_match_suffix_of_other_names() {
        let sums = "abc123 *foo-amd64.img\n";
        assert!(checksum_for(sums, "amd64.img").is_none());
    }

    #[test]
    fn sha256_of_known_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn instance_file_layout() {
        let store = ImageStore::new("/work", 10).unwrap();
        assert_eq!(
            store.overlay_path("pool3"),
            PathBuf::from("/work/.instance_data/pool3.img")
        );
        assert_eq!(
            store.userdata_path("pool3"),
            PathBuf::from("/work/.instance_data/pool3_userdata.img")
        );
        assert_eq!(
            store.console_path("pool3"),
            PathBuf::from("/work/.instance_data/pool3_console")
        );
    }

    #[test]
    fn prepare_workdir_wipes_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), 10).unwrap();

        store.prepare_workdir().unwrap();
        let stale = store.instance_data_dir().join("pool0.img");
        std::fs::write(&stale, b"stale").unwrap();

        store.prepare_workdir().unwrap();
        assert!(!stale.exists());

        let mode = std::fs::metadata(store.instance_data_dir())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn create_overlay_surfaces_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), 10)
            .unwrap()
            .with_qemu_img("false");

        let err = store.create_overlay("pool0").await.unwrap_err();
        assert!(matches!(err, ImageError::Convert(_)));
    }

    #[tokio::test]
    async fn create_overlay_returns_layout_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), 10)
            .unwrap()
            .with_qemu_img("true");

        let overlay = store.create_overlay("pool0").await.unwrap();
        assert_eq!(overlay, store.overlay_path("pool0"));
    }
}
