//! Reference images

use image::{DynamicImage, GrayImage};
use once_cell::sync::OnceCell;
use sightline_common::{Error, Result};
use std::path::{Path, PathBuf};

/// Similarity an image must reach unless it declares its own
pub const DEFAULT_SIMILARITY: f64 = 0.98;

/// A named template searched for on screen
///
/// Pixels are decoded on first use and cached for the life of the image.
#[derive(Debug)]
pub struct ReferenceImage {
    name: String,
    similarity: f64,
    focus_delta: (i32, i32),
    source: Option<PathBuf>,
    pixels: OnceCell<GrayImage>,
}

impl ReferenceImage {
    /// An image backed by a file, decoded lazily
    pub fn from_file(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        similarity: f64,
        focus_delta: (i32, i32),
    ) -> Result<Self> {
        let name = name.into();
        check_similarity(&name, similarity)?;
        Ok(Self {
            name,
            similarity,
            focus_delta,
            source: Some(path.into()),
            pixels: OnceCell::new(),
        })
    }

    /// An image built from pixels already in memory
    pub fn from_image(name: impl Into<String>, image: &DynamicImage) -> Self {
        Self {
            name: name.into(),
            similarity: DEFAULT_SIMILARITY,
            focus_delta: (0, 0),
            source: None,
            pixels: OnceCell::with_value(image.to_luma8()),
        }
    }

    pub fn with_similarity(mut self, similarity: f64) -> Result<Self> {
        check_similarity(&self.name, similarity)?;
        self.similarity = similarity;
        Ok(self)
    }

    pub fn with_focus_delta(mut self, dx: i32, dy: i32) -> Self {
        self.focus_delta = (dx, dy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn similarity(&self) -> f64 {
        self.similarity
    }

    pub fn focus_delta(&self) -> (i32, i32) {
        self.focus_delta
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Luma pixels, decoding the source file on first call
    pub fn pixels(&self) -> Result<&GrayImage> {
        self.pixels.get_or_try_init(|| {
            let path = self.source.as_ref().ok_or_else(|| {
                Error::Catalog(format!("image {} has neither pixels nor a source file", self.name))
            })?;
            let decoded = image::open(path).map_err(|e| {
                Error::Catalog(format!("cannot decode {} ({}): {}", self.name, path.display(), e))
            })?;
            Ok(decoded.to_luma8())
        })
    }

    /// Width and height, if the pixels have been decoded
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.pixels.get().map(|p| p.dimensions())
    }
}

fn check_similarity(name: &str, similarity: f64) -> Result<()> {
    if similarity > 0.0 && similarity < 1.0 {
        Ok(())
    } else {
        Err(Error::Catalog(format!(
            "similarity of {} must lie strictly between 0 and 1, got {}",
            name, similarity
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_similarity_bounds() {
        assert!(ReferenceImage::from_file("a", "a.png", 0.5, (0, 0)).is_ok());
        assert!(ReferenceImage::from_file("a", "a.png", 1.0, (0, 0)).is_err());
        assert!(ReferenceImage::from_file("a", "a.png", 0.0, (0, 0)).is_err());
    }

    #[test]
    fn test_lazy_decoding_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dot.png");
        GrayImage::from_pixel(6, 4, Luma([200])).save(&path).unwrap();

        let image = ReferenceImage::from_file("dot", &path, DEFAULT_SIMILARITY, (0, 0)).unwrap();
        assert_eq!(image.dimensions(), None);
        assert_eq!(image.pixels().unwrap().dimensions(), (6, 4));

        std::fs::remove_file(&path).unwrap();
        assert_eq!(image.pixels().unwrap().dimensions(), (6, 4));
        assert_eq!(image.dimensions(), Some((6, 4)));
    }

    #[test]
    fn test_missing_file_is_a_catalog_error() {
        let image = ReferenceImage::from_file("gone", "/nonexistent/gone.png", 0.9, (0, 0)).unwrap();
        assert!(matches!(image.pixels(), Err(Error::Catalog(_))));
    }
}
