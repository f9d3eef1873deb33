//! Where images come from.
//!
//! The pipeline asks an [`ImageSource`] for pixels by image id and never
//! touches the filesystem itself.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use image::RgbImage;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::TilefuseError;

/// File extensions [`DirectoryImageSource`] lists and loads.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp"];

/// Resolves an image id to decoded RGB pixels.
pub trait ImageSource: Send + Sync {
    /// # Errors
    /// [`TilefuseError::ImageNotFound`] for an unknown id,
    /// [`TilefuseError::ImageDecode`] for bytes that are not a supported image.
    fn load(&self, image_id: &str) -> Result<RgbImage, TilefuseError>;
}

/// Images stored under a root directory, identified by their path relative to it.
#[derive(Clone, Debug)]
pub struct DirectoryImageSource {
    root: PathBuf,
}

impl DirectoryImageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists every image under the root, recursively, as sorted image ids.
    pub fn list(&self) -> Result<Vec<String>, TilefuseError> {
        let mut ids = Vec::new();

        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = entry.map_err(|source| TilefuseError::Io(source.into()))?;
            if !entry.file_type().is_file() || !has_image_extension(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            ids.push(image_id_for(relative));
        }

        ids.sort();
        debug!(root = %self.root.display(), count = ids.len(), "listed images");
        Ok(ids)
    }

    fn resolve(&self, image_id: &str) -> Option<PathBuf> {
        let relative = Path::new(image_id);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return None;
        }
        let path = self.root.join(relative);
        path.is_file().then_some(path)
    }
}

impl ImageSource for DirectoryImageSource {
    fn load(&self, image_id: &str) -> Result<RgbImage, TilefuseError> {
        let path = self
            .resolve(image_id)
            .ok_or_else(|| TilefuseError::ImageNotFound {
                image_id: image_id.to_string(),
            })?;

        let decoded = image::open(&path).map_err(|source| TilefuseError::ImageDecode {
            image_id: image_id.to_string(),
            source,
        })?;
        Ok(decoded.into_rgb8())
    }
}

fn has_image_extension(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return false;
    };
    IMAGE_EXTENSIONS
        .iter()
        .any(|allowed| ext.eq_ignore_ascii_case(allowed))
}

fn image_id_for(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Images held in memory. Handy for tests and for callers that decode themselves.
#[derive(Clone, Debug, Default)]
pub struct MemoryImageSource {
    images: HashMap<String, RgbImage>,
}

impl MemoryImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image_id: impl Into<String>, image: RgbImage) {
        self.images.insert(image_id.into(), image);
    }

    pub fn with_image(mut self, image_id: impl Into<String>, image: RgbImage) -> Self {
        self.insert(image_id, image);
        self
    }
}

impl ImageSource for MemoryImageSource {
    fn load(&self, image_id: &str) -> Result<RgbImage, TilefuseError> {
        self.images
            .get(image_id)
            .cloned()
            .ok_or_else(|| TilefuseError::ImageNotFound {
                image_id: image_id.to_string(),
            })
    }
}
