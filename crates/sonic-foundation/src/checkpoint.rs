//! Checkpoint layout and integrity checks.
//!
//! Paths are resolved once at load time relative to the configured
//! checkpoint directory. An optional `manifest.sha256` in `sha256sum`
//! format pins the expected digests.

use sha2::{Digest, Sha256};
use sonic_kernel::error::ModelLoadError;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "manifest.sha256";

/// Bytes hashed from the head of each checkpoint to fingerprint it.
const FINGERPRINT_HEAD: usize = 1024 * 1024;

/// One trained component of the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    AudioEncoder,
    FaceDetector,
    AudioToToken,
    AudioToBucket,
    Unet,
    Vae,
}

impl Component {
    pub const ALL: [Component; 6] = [
        Component::AudioEncoder,
        Component::FaceDetector,
        Component::AudioToToken,
        Component::AudioToBucket,
        Component::Unet,
        Component::Vae,
    ];

    pub fn relative_path(&self) -> &'static str {
        match self {
            Component::AudioEncoder => "whisper-tiny/model.safetensors",
            Component::FaceDetector => "yoloface_v5m.pt",
            Component::AudioToToken => "Sonic/audio2token.pth",
            Component::AudioToBucket => "Sonic/audio2bucket.pth",
            Component::Unet => "Sonic/unet.pth",
            Component::Vae => {
                "stable-video-diffusion-img2vid-xt/vae/diffusion_pytorch_model.safetensors"
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Component::AudioEncoder => "audio encoder",
            Component::FaceDetector => "face detector",
            Component::AudioToToken => "audio-to-token",
            Component::AudioToBucket => "audio-to-bucket",
            Component::Unet => "unet",
            Component::Vae => "vae decoder",
        }
    }
}

/// A resolved, non-empty checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFile {
    pub component: Component,
    pub path: PathBuf,
    pub size: u64,
    /// SHA-256 over the file size and its first MiB.
    pub fingerprint: [u8; 32],
}

/// Every checkpoint the bundle needs.
#[derive(Debug, Clone)]
pub struct CheckpointSet {
    pub root: PathBuf,
    files: Vec<CheckpointFile>,
}

impl CheckpointSet {
    /// Resolve all components under `root`, verifying the manifest when
    /// `verify_manifest` is set and a manifest exists.
    pub fn resolve(root: &Path, verify_manifest: bool) -> Result<Self, ModelLoadError> {
        let mut files = Vec::with_capacity(Component::ALL.len());
        for component in Component::ALL {
            let path = root.join(component.relative_path());
            let meta = std::fs::metadata(&path)
                .map_err(|_| ModelLoadError::CheckpointMissing(path.clone()))?;
            if !meta.is_file() {
                return Err(ModelLoadError::CheckpointMissing(path));
            }
            if meta.len() == 0 {
                return Err(ModelLoadError::CheckpointCorrupt {
                    path,
                    reason: "file is empty".to_string(),
                });
            }
            let fingerprint = fingerprint(&path, meta.len())?;
            debug!(
                component = component.name(),
                path = %path.display(),
                size = meta.len(),
                "Checkpoint resolved"
            );
            files.push(CheckpointFile {
                component,
                path,
                size: meta.len(),
                fingerprint,
            });
        }

        let manifest = root.join(MANIFEST_FILE);
        if verify_manifest && manifest.is_file() {
            let verified = verify(root, &manifest)?;
            info!(files = verified, "Checkpoint manifest verified");
        }

        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    pub fn get(&self, component: Component) -> Option<&CheckpointFile> {
        self.files.iter().find(|f| f.component == component)
    }

    pub fn files(&self) -> &[CheckpointFile] {
        &self.files
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> ModelLoadError {
    ModelLoadError::CheckpointCorrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn fingerprint(path: &Path, size: u64) -> Result<[u8; 32], ModelLoadError> {
    let file = File::open(path).map_err(|e| corrupt(path, e.to_string()))?;
    let mut head = Vec::with_capacity(FINGERPRINT_HEAD);
    file.take(FINGERPRINT_HEAD as u64)
        .read_to_end(&mut head)
        .map_err(|e| corrupt(path, e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(size.to_le_bytes());
    hasher.update(&head);
    Ok(hasher.finalize().into())
}

/// Full SHA-256 of a file, hex encoded.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Parse one `sha256sum` line into `(digest, relative path)`.
fn parse_manifest_line(line: &str) -> Option<(String, &str)> {
    let (digest, rest) = line.split_once(char::is_whitespace)?;
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    // binary-mode entries carry a leading '*'
    let rel = rest.trim_start().trim_start_matches('*').trim_end();
    if rel.is_empty() {
        return None;
    }
    Some((digest.to_ascii_lowercase(), rel))
}

/// Check every manifest entry. Returns the number of verified files.
fn verify(root: &Path, manifest: &Path) -> Result<usize, ModelLoadError> {
    let content = std::fs::read_to_string(manifest).map_err(|e| corrupt(manifest, e.to_string()))?;

    let mut verified = 0;
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (expected, rel) = parse_manifest_line(line)
            .ok_or_else(|| corrupt(manifest, format!("malformed entry on line {}", lineno + 1)))?;

        let path = root.join(rel);
        if !path.is_file() {
            return Err(ModelLoadError::CheckpointMissing(path));
        }
        let actual = sha256_file(&path).map_err(|e| corrupt(&path, e.to_string()))?;
        if actual != expected {
            return Err(corrupt(
                &path,
                format!("sha256 mismatch: expected {expected}, found {actual}"),
            ));
        }
        verified += 1;
    }
    Ok(verified)
}
