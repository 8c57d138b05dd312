use std::{
    collections::BTreeMap,
    fmt::{self, Formatter},
    fs,
    path::{Path, PathBuf},
};

use landmarker_shared::{
    absolute_path,
    log::{debug, info, trace, warn},
    walkdir::WalkDir,
};

use crate::{
    common::{extract_extension_from_path, AssetId, Mode},
    Error, IdentifierStrategy, Result,
};

/// Maps every [`AssetId`] to the file it was derived from.
pub type AssetPathTable = BTreeMap<AssetId, PathBuf>;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff", "tga", "webp", "ppm", "pgm"];
pub const MESH_EXTENSIONS: &[&str] = &["obj", "gltf", "glb"];

/// Extensions of the files that can be imported in the given mode.
pub fn importable_extensions(mode: Mode) -> &'static [&'static str] {
    match mode {
        Mode::Image => IMAGE_EXTENSIONS,
        Mode::Mesh => MESH_EXTENSIONS,
    }
}

/// Determines which files of an asset directory are considered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPattern {
    /// Descend into subdirectories.
    pub recursive: bool,
    /// Only files with this extension (without the leading dot) are considered.
    pub extension: Option<String>,
    /// Directories that are never entered, e.g. a cache directory inside of the asset directory.
    pub excluded_dirs: Vec<PathBuf>,
}

impl ScanPattern {
    pub fn new(recursive: bool, extension: Option<String>) -> Self {
        let extension = extension.map(|extension| extension.trim_start_matches('.').to_lowercase());
        Self {
            recursive,
            extension,
            excluded_dirs: Vec::new(),
        }
    }

    pub fn with_excluded_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded_dirs.push(dir.into());
        self
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.excluded_dirs.iter().any(|dir| path == dir)
    }

    fn matches(&self, extension: &str) -> bool {
        self.extension.as_deref().map_or(true, |expected| expected == extension)
    }
}

impl fmt::Display for ScanPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.recursive {
            write!(f, "**/")?;
        }
        match &self.extension {
            Some(extension) => write!(f, "*.{extension}"),
            None => write!(f, "*"),
        }
    }
}

/// Checks that the asset directory exists and returns its absolute path.
pub fn ensure_asset_dir(asset_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let asset_dir = absolute_path(asset_dir);
    if !asset_dir.is_dir() {
        return Err(Error::InvalidPath(asset_dir));
    }
    debug!("assets:    {}", asset_dir.display());
    Ok(asset_dir)
}

/// Creates the cache directory if necessary and returns its absolute path.
pub fn ensure_cache_dir(cache_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let cache_dir = absolute_path(cache_dir);
    if !cache_dir.is_dir() {
        warn!("The cache dir does not exist - creating {}", cache_dir.display());
        fs::create_dir_all(&cache_dir)?;
    }
    debug!("cache:     {}", cache_dir.display());
    Ok(cache_dir)
}

/// Lists the files in `root` that can be imported in the given mode and match the `pattern`. The
/// paths are sorted.
pub fn asset_paths(root: impl AsRef<Path>, mode: Mode, pattern: &ScanPattern) -> Result<Vec<PathBuf>> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(Error::InvalidPath(root.to_owned()));
    }
    info!("Searching for {mode} assets in '{}' with pattern '{pattern}'", root.display());

    let extensions = importable_extensions(mode);
    let max_depth = if pattern.recursive { usize::MAX } else { 1 };

    let mut paths = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .min_depth(1)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| {
            let excluded = entry.file_type().is_dir() && pattern.is_excluded(entry.path());
            if excluded {
                trace!("Skipping excluded directory: {}", entry.path().display());
            }
            !excluded
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Failed to read directory entry in '{}': {err}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        // We are only interested in files with supported extensions.
        let Ok(extension) = extract_extension_from_path(entry.path()) else {
            trace!("Skipping file without extension: {}", entry.path().display());
            continue;
        };
        if !extensions.contains(&extension.as_str()) || !pattern.matches(&extension) {
            continue;
        }
        paths.push(entry.into_path());
    }
    paths.sort();
    Ok(paths)
}

/// Builds the [`AssetPathTable`] for the given paths.
///
/// Fails with [`Error::DuplicateAssetIdentifier`] when two paths map to the same [`AssetId`].
pub fn build_asset_mapping<I, P>(identifier: &IdentifierStrategy, paths: I) -> Result<AssetPathTable>
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    let mut table = AssetPathTable::new();
    for path in paths {
        let path = path.into();
        let asset_id = identifier.identifier(&path)?;
        if let Some(first) = table.get(&asset_id) {
            return Err(Error::DuplicateAssetIdentifier {
                asset_id,
                first: first.clone(),
                second: path,
            });
        }
        table.insert(asset_id, path);
    }
    Ok(table)
}

/// Scans `root` and builds the [`AssetPathTable`].
pub fn index(root: impl AsRef<Path>, mode: Mode, pattern: &ScanPattern, identifier: &IdentifierStrategy) -> Result<AssetPathTable> {
    let paths = asset_paths(root, mode, pattern)?;
    let table = build_asset_mapping(identifier, paths)?;
    info!("Found {} {mode} assets", table.len());
    Ok(table)
}
