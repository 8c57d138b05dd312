use std::{
    fs, io,
    path::{Path, PathBuf},
};

use landmarker_shared::{
    log::{debug, info, trace, warn},
    parking_lot::RwLock,
};

use crate::{
    cache_builder::{is_cached, AssetBuilder},
    common::{safe_join, AssetId, CacheFile, Mode},
    image_asset::{self, ImageAsset},
    Error, Result,
};

/// Read access to cached images and textures.
pub trait ImageSource: Send + Sync {
    /// Sorted ids of all cache entries with an image.
    fn asset_ids(&self) -> Vec<AssetId>;
    fn image_info_path(&self, asset_id: &str) -> Result<PathBuf>;
    fn texture_path(&self, asset_id: &str) -> Result<PathBuf>;
    fn thumbnail_path(&self, asset_id: &str) -> Result<PathBuf>;
}

/// Images that can be added while the server is running.
pub trait ImageUpload: ImageSource {
    /// Caches the encoded image and returns the id under which it is served.
    fn cache_image(&self, asset_id: &str, bytes: Vec<u8>) -> Result<AssetId>;
}

/// Read access to cached meshes.
pub trait MeshSource: Send + Sync {
    /// Sorted ids of all cache entries with a mesh.
    fn asset_ids(&self) -> Vec<AssetId>;
    fn mesh_path(&self, asset_id: &str) -> Result<PathBuf>;
}

/// Lists the complete cache entries. When `required_file` is given, only entries containing that
/// file are returned.
pub fn cached_asset_ids(cache_dir: impl AsRef<Path>, required_file: Option<&str>) -> Result<Vec<AssetId>> {
    let cache_dir = cache_dir.as_ref();
    let mut asset_ids = Vec::new();
    for entry in fs::read_dir(cache_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(AssetId::new) else {
            trace!("Skipping cache entry with non UTF-8 name: {:?}", entry.file_name());
            continue;
        };
        if !is_cached(cache_dir, &name) {
            trace!("Skipping incomplete cache entry {name}");
            continue;
        }
        if required_file.map_or(true, |file| entry.path().join(file).is_file()) {
            asset_ids.push(name);
        }
    }
    asset_ids.sort();
    Ok(asset_ids)
}

/// Resolves `file` inside of the cache entry of `asset_id`. Fails with [`Error::NotFound`] when the
/// entry is incomplete or the file doesn't exist.
fn cache_file_path(cache_dir: &Path, asset_id: &str, file: &str) -> Result<PathBuf> {
    let entry_path = safe_join(cache_dir, asset_id)?;
    let path = entry_path.join(file);
    if !is_cached(cache_dir, &AssetId::new(asset_id)) || !path.is_file() {
        return Err(Error::NotFound(format!("{asset_id}/{file}")));
    }
    Ok(path)
}

/// Images in the cache directory. New images can be added at runtime with [`ImageCache::cache_image`].
pub struct ImageCache {
    cache_dir: PathBuf,
    asset_ids: RwLock<Vec<AssetId>>,
}

impl ImageCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let asset_ids = cached_asset_ids(&cache_dir, Some(CacheFile::IMAGE_INFO))?;
        info!("Serving {} images from '{}'", asset_ids.len(), cache_dir.display());
        Ok(Self {
            cache_dir,
            asset_ids: RwLock::new(asset_ids),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Reads the cache directory again.
    pub fn rescan(&self) -> Result<()> {
        let asset_ids = cached_asset_ids(&self.cache_dir, Some(CacheFile::IMAGE_INFO))?;
        debug!("Rescanned '{}' and found {} images", self.cache_dir.display(), asset_ids.len());
        *self.asset_ids.write() = asset_ids;
        Ok(())
    }

    /// Caches an uploaded image and returns the id under which it is served. When `asset_id` is
    /// taken already, a suffix `_1`, `_2`, ... is appended.
    pub fn cache_image(&self, asset_id: &str, bytes: Vec<u8>) -> Result<AssetId> {
        if !AssetId::new(asset_id).is_safe() {
            return Err(Error::InvalidPath(self.cache_dir.join(asset_id)));
        }
        let image = ImageAsset::from_bytes(asset_id, bytes)?;

        let (asset_id, cache_entry_path) = self.claim_entry(asset_id)?;
        info!("Caching uploaded image as {asset_id}");
        let mut asset_builder = AssetBuilder::new(&asset_id, &cache_entry_path);
        let result = image_asset::cache_image(&mut asset_builder, &image).and_then(|()| asset_builder.build(Mode::Image));
        if let Err(err) = result {
            if let Err(remove_err) = fs::remove_dir_all(&cache_entry_path) {
                warn!("Failed to remove the incomplete cache entry '{}': {remove_err}", cache_entry_path.display());
            }
            return Err(err);
        }

        self.rescan()?;
        Ok(asset_id)
    }

    /// Creates the directory of a new cache entry. `create_dir` fails for existing directories so
    /// two uploads can't claim the same name.
    fn claim_entry(&self, asset_id: &str) -> Result<(AssetId, PathBuf)> {
        let mut suffix = 0usize;
        loop {
            let candidate = match suffix {
                0 => AssetId::new(asset_id),
                _ => AssetId::new(format!("{asset_id}_{suffix}")),
            };
            let path = self.cache_dir.join(candidate.as_str());
            match fs::create_dir(&path) {
                Ok(()) => return Ok((candidate, path)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl ImageUpload for ImageCache {
    fn cache_image(&self, asset_id: &str, bytes: Vec<u8>) -> Result<AssetId> {
        ImageCache::cache_image(self, asset_id, bytes)
    }
}

impl ImageSource for ImageCache {
    fn asset_ids(&self) -> Vec<AssetId> {
        self.asset_ids.read().clone()
    }

    fn image_info_path(&self, asset_id: &str) -> Result<PathBuf> {
        cache_file_path(&self.cache_dir, asset_id, CacheFile::IMAGE_INFO)
    }

    fn texture_path(&self, asset_id: &str) -> Result<PathBuf> {
        cache_file_path(&self.cache_dir, asset_id, CacheFile::TEXTURE)
    }

    fn thumbnail_path(&self, asset_id: &str) -> Result<PathBuf> {
        cache_file_path(&self.cache_dir, asset_id, CacheFile::THUMBNAIL)
    }
}

/// Meshes in the cache directory.
pub struct MeshCache {
    cache_dir: PathBuf,
    asset_ids: Vec<AssetId>,
}

impl MeshCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let asset_ids = cached_asset_ids(&cache_dir, Some(CacheFile::MESH))?;
        info!("Serving {} meshes from '{}'", asset_ids.len(), cache_dir.display());
        Ok(Self { cache_dir, asset_ids })
    }
}

impl MeshSource for MeshCache {
    fn asset_ids(&self) -> Vec<AssetId> {
        self.asset_ids.clone()
    }

    fn mesh_path(&self, asset_id: &str) -> Result<PathBuf> {
        cache_file_path(&self.cache_dir, asset_id, CacheFile::MESH)
    }
}

#[cfg(test)]
mod tests {
    use image::ImageFormat;
    use landmarker_test::{setup_logger, write_image, write_quad_obj};
    use tempdir::TempDir;

    use super::*;
    use crate::{
        asset_paths::ScanPattern,
        cache_builder::{build_cache, CacheOptions, Concurrency},
    };

    fn cached_root(mode: Mode) -> (TempDir, PathBuf) {
        setup_logger();
        let root = TempDir::new("cache_reader").unwrap();
        match mode {
            Mode::Image => {
                write_image(root.path().join("assets/b.png"), 8, 8, ImageFormat::Png);
                write_image(root.path().join("assets/a.jpg"), 8, 8, ImageFormat::Jpeg);
            }
            Mode::Mesh => {
                write_quad_obj(root.path().join("assets/plain.obj"), false);
                write_quad_obj(root.path().join("assets/textured.obj"), true);
            }
        }
        let options = CacheOptions {
            asset_dir: root.path().join("assets"),
            cache_dir: root.path().join("cache"),
            mode,
            pattern: ScanPattern::default(),
            concurrency: Concurrency::Serial,
        };
        let (cache_dir, _, _) = build_cache(&options).unwrap();
        (root, cache_dir)
    }

    #[test]
    fn image_paths() {
        let (_root, cache_dir) = cached_root(Mode::Image);
        let image_cache = ImageCache::new(&cache_dir).unwrap();

        assert_eq!(image_cache.asset_ids(), vec![AssetId::new("a"), AssetId::new("b")]);
        assert_eq!(image_cache.texture_path("a").unwrap(), cache_dir.join("a").join(CacheFile::TEXTURE));
        assert!(image_cache.thumbnail_path("b").unwrap().is_file());
        assert!(image_cache.image_info_path("c").unwrap_err().is_not_found());
    }

    #[test]
    fn escaping_ids_are_not_found() {
        let (_root, cache_dir) = cached_root(Mode::Image);
        let image_cache = ImageCache::new(&cache_dir).unwrap();

        assert!(image_cache.texture_path("../cache/a").unwrap_err().is_not_found());
        assert!(image_cache.texture_path("..").unwrap_err().is_not_found());
    }

    #[test]
    fn incomplete_entries_are_hidden() {
        let (_root, cache_dir) = cached_root(Mode::Image);
        fs::create_dir_all(cache_dir.join("partial")).unwrap();
        fs::write(cache_dir.join("partial").join(CacheFile::IMAGE_INFO), "{}").unwrap();

        let image_cache = ImageCache::new(&cache_dir).unwrap();
        assert_eq!(image_cache.asset_ids().len(), 2);
        assert!(image_cache.image_info_path("partial").unwrap_err().is_not_found());
    }

    #[test]
    fn uploads_get_unique_ids() {
        let (root, cache_dir) = cached_root(Mode::Image);
        let image_cache = ImageCache::new(&cache_dir).unwrap();
        let bytes = fs::read(root.path().join("assets/a.jpg")).unwrap();

        // When
        let first = image_cache.cache_image("a", bytes.clone()).unwrap();
        let second = image_cache.cache_image("a", bytes.clone()).unwrap();
        let third = image_cache.cache_image("upload", bytes).unwrap();

        // Then
        assert_eq!(first.as_str(), "a_1");
        assert_eq!(second.as_str(), "a_2");
        assert_eq!(third.as_str(), "upload");
        assert_eq!(image_cache.asset_ids().len(), 5);
        assert!(image_cache.texture_path("a_2").unwrap().is_file());
    }

    #[test]
    fn broken_upload_leaves_no_entry() {
        let (_root, cache_dir) = cached_root(Mode::Image);
        let image_cache = ImageCache::new(&cache_dir).unwrap();

        let result = image_cache.cache_image("broken", b"garbage".to_vec());
        assert!(matches!(result, Err(Error::DecodeFailure { .. })));
        assert!(!cache_dir.join("broken").exists());
    }

    #[test]
    fn mesh_cache_and_textures() {
        let (_root, cache_dir) = cached_root(Mode::Mesh);
        let mesh_cache = MeshCache::new(&cache_dir).unwrap();
        let image_cache = ImageCache::new(&cache_dir).unwrap();

        assert_eq!(mesh_cache.asset_ids(), vec![AssetId::new("plain"), AssetId::new("textured")]);
        assert!(mesh_cache.mesh_path("plain").unwrap().is_file());
        assert!(mesh_cache.mesh_path("missing").unwrap_err().is_not_found());
        assert_eq!(image_cache.asset_ids(), vec![AssetId::new("textured")]);
        assert!(image_cache.texture_path("plain").unwrap_err().is_not_found());
    }
}
