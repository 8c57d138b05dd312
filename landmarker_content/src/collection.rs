use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use landmarker_shared::log::{debug, info};

use crate::{
    cache_reader::cached_asset_ids,
    common::{extract_file_stem_from_path, ALL_COLLECTION_ID, COLLECTION_EXTENSION},
    Error, Result,
};

/// Named lists of asset ids.
pub trait CollectionStore: Send + Sync {
    fn collection_ids(&self) -> Vec<String>;
    fn collection(&self, collection_id: &str) -> Result<Vec<String>>;
}

/// Parses a collection file. Every line is an asset id; blank lines are ignored and duplicates are kept.
///
/// # Example
///
/// ```rust
/// use landmarker_content::collection::parse_collection;
/// assert_eq!(parse_collection("a\n\nb\nb\n"), vec!["a", "b", "b"]);
/// ```
pub fn parse_collection(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

pub fn load_collection(path: impl AsRef<Path>) -> Result<Vec<String>> {
    Ok(parse_collection(&fs::read_to_string(path)?))
}

fn missing_collection(collection_id: &str) -> Error {
    Error::NotFound(format!("collection '{collection_id}'"))
}

/// Every `*.txt` file of a directory, read once at startup.
#[derive(Debug)]
pub struct FileCollectionStore {
    collections: BTreeMap<String, Vec<String>>,
}

impl FileCollectionStore {
    pub fn new(collection_dir: impl Into<PathBuf>) -> Result<Self> {
        let collection_dir = collection_dir.into();
        if !collection_dir.is_dir() {
            return Err(Error::InvalidPath(collection_dir));
        }
        debug!("collections: {}", collection_dir.display());

        let mut collections = BTreeMap::new();
        for entry in fs::read_dir(&collection_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().map_or(true, |e| e != COLLECTION_EXTENSION) {
                continue;
            }
            collections.insert(extract_file_stem_from_path(&path)?, load_collection(&path)?);
        }
        let store = Self { collections };
        info!("{store}");
        Ok(store)
    }
}

impl std::fmt::Display for FileCollectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Serving {} collection(s):", self.collections.len())?;
        for (collection_id, asset_ids) in &self.collections {
            write!(f, "\n - {collection_id} ({} assets)", asset_ids.len())?;
        }
        Ok(())
    }
}

impl CollectionStore for FileCollectionStore {
    fn collection_ids(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    fn collection(&self, collection_id: &str) -> Result<Vec<String>> {
        self.collections
            .get(collection_id)
            .cloned()
            .ok_or_else(|| missing_collection(collection_id))
    }
}

/// The single collection [`ALL_COLLECTION_ID`] with every cached asset.
#[derive(Debug)]
pub struct AllCacheCollection {
    asset_ids: Vec<String>,
}

impl AllCacheCollection {
    pub fn new(cache_dir: impl AsRef<Path>) -> Result<Self> {
        let asset_ids = cached_asset_ids(cache_dir, None)?
            .into_iter()
            .map(|asset_id| asset_id.to_string())
            .collect::<Vec<_>>();
        info!("Serving collection '{ALL_COLLECTION_ID}' with {} assets", asset_ids.len());
        Ok(Self { asset_ids })
    }
}

impl CollectionStore for AllCacheCollection {
    fn collection_ids(&self) -> Vec<String> {
        vec![ALL_COLLECTION_ID.to_owned()]
    }

    fn collection(&self, collection_id: &str) -> Result<Vec<String>> {
        if collection_id != ALL_COLLECTION_ID {
            return Err(missing_collection(collection_id));
        }
        Ok(self.asset_ids.clone())
    }
}
