use std::path::{Path, PathBuf};

use serde::Serialize;

/// Extensions the players are expected to handle.
const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "mov", "avi", "webm", "m4v", "jpg", "jpeg", "png", "gif", "webp", "mp3", "flac",
    "wav", "ogg",
];

/// Files available to playlists, rooted at one directory.
///
/// References are plain file names; anything that looks like a path is cut
/// down to its last component so a reference can never leave the root.
#[derive(Debug, Clone)]
pub struct MediaLibrary {
    root: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaFile {
    pub name: String,
    pub size_bytes: u64,
}

impl MediaLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a reference, if the file exists.
    pub fn resolve(&self, file_ref: &str) -> Option<PathBuf> {
        let name = Path::new(file_ref.trim()).file_name()?;
        let path = self.root.join(name);
        path.is_file().then_some(path)
    }

    pub fn exists(&self, file_ref: &str) -> bool {
        self.resolve(file_ref).is_some()
    }

    /// Playable files directly under the root, sorted by name.
    pub fn list(&self) -> anyhow::Result<Vec<MediaFile>> {
        if !self.root.exists() {
            anyhow::bail!("media dir does not exist: {}", self.root.display());
        }

        // References resolve against the root only, so only the root is listed.
        let rd = std::fs::read_dir(&self.root)
            .map_err(|e| anyhow::anyhow!("failed to read_dir({}): {e}", self.root.display()))?;
        let mut out = Vec::new();
        for ent in rd {
            let ent = ent.map_err(|e| anyhow::anyhow!("failed to read_dir entry: {e}"))?;
            let p = ent.path();
            if !p.is_file() {
                continue;
            }
            let Some(ext) = p.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let ext = ext.to_ascii_lowercase();
            if !MEDIA_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            let Some(name) = p.file_name() else { continue };
            out.push(MediaFile {
                name: name.to_string_lossy().to_string(),
                size_bytes: ent.metadata().map(|m| m.len()).unwrap_or(0),
            });
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}
