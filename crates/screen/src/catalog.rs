//! Image catalogs
//!
//! A catalog is a directory of reference images. Images may be declared in
//! an `images.toml` file to override their similarity and focus offset:
//!
//! ```toml
//! [image.continue]
//! filename = "continue.png"
//! similarity = 0.9
//! focus_delta = [10, -20]
//! ```
//!
//! Every other file recognised as an image is loaded under its file stem
//! with default parameters.

use image::ImageFormat;
use serde::Deserialize;
use sightline_common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::reference::{ReferenceImage, DEFAULT_SIMILARITY};

/// Name of the declaration file inside an images directory
pub const CATALOG_FILE: &str = "images.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    image: BTreeMap<String, DeclaredImage>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeclaredImage {
    filename: Option<String>,
    similarity: Option<f64>,
    focus_delta: Option<[i32; 2]>,
}

/// Name to reference image mapping of one test
#[derive(Debug, Default, Clone)]
pub struct ImageCatalog {
    dir: Option<PathBuf>,
    images: BTreeMap<String, Arc<ReferenceImage>>,
}

impl ImageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every image of `dir`; pixels are decoded before returning
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::Catalog(format!(
                "image directory {} does not exist",
                dir.display()
            )));
        }

        let declarations = read_declarations(dir)?;
        let mut catalog = Self {
            dir: Some(dir.to_path_buf()),
            images: BTreeMap::new(),
        };
        let mut claimed = BTreeSet::new();

        for (name, declared) in declarations.image {
            let filename = declared.filename.ok_or_else(|| {
                Error::Catalog(format!("image {} in {} has no filename", name, CATALOG_FILE))
            })?;
            let path = dir.join(&filename);
            if !path.is_file() {
                return Err(Error::Catalog(format!(
                    "image {} refers to missing file {}",
                    name,
                    path.display()
                )));
            }
            let [dx, dy] = declared.focus_delta.unwrap_or([0, 0]);
            let image = ReferenceImage::from_file(
                name.clone(),
                path,
                declared.similarity.unwrap_or(DEFAULT_SIMILARITY),
                (dx, dy),
            )?;
            claimed.insert(PathBuf::from(filename));
            catalog.images.insert(name, Arc::new(image));
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        for path in files {
            let Some(file_name) = path.file_name() else { continue };
            if file_name == CATALOG_FILE || claimed.contains(Path::new(file_name)) {
                continue;
            }
            if ImageFormat::from_path(&path).is_err() {
                debug!("Ignoring {} in image directory", path.display());
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            if catalog.images.contains_key(&stem) {
                warn!("Image {} is defined twice, ignoring {}", stem, path.display());
                continue;
            }
            let image = ReferenceImage::from_file(stem.clone(), path, DEFAULT_SIMILARITY, (0, 0))?;
            catalog.images.insert(stem, Arc::new(image));
        }

        for image in catalog.images.values() {
            image.pixels()?;
        }
        debug!("Loaded {} images from {}", catalog.images.len(), dir.display());

        Ok(catalog)
    }

    /// Add an image, replacing one of the same name
    pub fn insert(&mut self, image: ReferenceImage) -> Arc<ReferenceImage> {
        let image = Arc::new(image);
        self.images.insert(image.name().to_string(), image.clone());
        image
    }

    pub fn get(&self, name: &str) -> Option<Arc<ReferenceImage>> {
        self.images.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Directory the catalog was loaded from
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

fn read_declarations(dir: &Path) -> Result<CatalogFile> {
    let path = dir.join(CATALOG_FILE);
    if !path.is_file() {
        return Ok(CatalogFile::default());
    }
    let content = std::fs::read_to_string(&path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Catalog(format!("cannot parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) {
        GrayImage::from_pixel(width, height, Luma([90]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_load_declared_and_implicit() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "continue.png", 8, 6);
        write_png(dir.path(), "grub.png", 10, 4);
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();
        std::fs::write(
            dir.path().join(CATALOG_FILE),
            "[image.next]\nfilename = \"continue.png\"\nsimilarity = 0.9\nfocus_delta = [10, -20]\n",
        )
        .unwrap();

        let catalog = ImageCatalog::load(dir.path()).unwrap();
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["grub", "next"]);

        let next = catalog.get("next").unwrap();
        assert_eq!(next.similarity(), 0.9);
        assert_eq!(next.focus_delta(), (10, -20));
        assert_eq!(next.dimensions(), Some((8, 6)));

        let grub = catalog.get("grub").unwrap();
        assert_eq!(grub.similarity(), DEFAULT_SIMILARITY);
        assert_eq!(grub.dimensions(), Some((10, 4)));
    }

    #[test]
    fn test_declaration_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CATALOG_FILE), "[image.a]\nsimilarity = 0.5\n").unwrap();
        assert!(matches!(ImageCatalog::load(dir.path()), Err(Error::Catalog(_))));

        std::fs::write(dir.path().join(CATALOG_FILE), "[image.a]\nfilename = \"a.png\"\n").unwrap();
        assert!(matches!(ImageCatalog::load(dir.path()), Err(Error::Catalog(_))));

        write_png(dir.path(), "a.png", 2, 2);
        std::fs::write(
            dir.path().join(CATALOG_FILE),
            "[image.a]\nfilename = \"a.png\"\nsimilarity = 1.5\n",
        )
        .unwrap();
        assert!(matches!(ImageCatalog::load(dir.path()), Err(Error::Catalog(_))));
    }

    #[test]
    fn test_missing_directory() {
        assert!(ImageCatalog::load(Path::new("/nonexistent/images")).is_err());
    }
}
