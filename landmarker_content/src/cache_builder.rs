use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use landmarker_shared::{
    log::{error, info, trace, warn},
    num_cpus,
    rayon::{prelude::*, ThreadPoolBuilder},
    serde_yaml,
};
use serde::{Deserialize, Serialize};

use crate::{
    asset_paths::{self, AssetPathTable, ScanPattern},
    common::{safe_join, AssetId, Mode, ASSET_META_FILE_NAME, CACHE_DIR_NAME, CACHE_SCHEMA_VERSION},
    image_asset::{self, ImageAsset},
    mesh_asset::{self, TriMesh},
    Error, IdentifierStrategy, Result,
};

/// Content of the completion marker `asset.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub version: u32,
    pub kind: Mode,
    pub files: Vec<String>,
}

/// Collects the files that are written into a cache entry and writes the completion marker once
/// all of them exist.
pub struct AssetBuilder {
    asset_id: AssetId,
    cache_entry_path: PathBuf,
    files: Vec<String>,
}

impl AssetBuilder {
    /// Creates a new [`AssetBuilder`]. The directory `cache_entry_path` must exist.
    pub(crate) fn new(asset_id: impl Into<AssetId>, cache_entry_path: impl Into<PathBuf>) -> Self {
        Self {
            asset_id: asset_id.into(),
            cache_entry_path: cache_entry_path.into(),
            files: Vec::new(),
        }
    }

    /// Returns the [`AssetId`] of the asset.
    pub fn asset_id(&self) -> &AssetId {
        &self.asset_id
    }

    /// Path to the directory of the cache entry.
    pub fn cache_entry_path(&self) -> &Path {
        &self.cache_entry_path
    }

    /// Registers a file of the cache entry. The name is relative to the cache entry directory.
    pub fn with_file(&mut self, file_name: impl Into<String>) -> &mut Self {
        let file_name = file_name.into();
        if !self.files.contains(&file_name) {
            self.files.push(file_name);
        }
        self
    }

    /// Builds the cache entry by writing the completion marker.
    pub(crate) fn build(self, kind: Mode) -> Result<()> {
        let meta = CacheEntryMeta {
            version: CACHE_SCHEMA_VERSION,
            kind,
            files: self.files,
        };
        let meta_file_content = serde_yaml::to_string(&meta).map_err(|err| Error::Other(Box::new(err)))?;
        fs::write(self.cache_entry_path.join(ASSET_META_FILE_NAME), meta_file_content)?;
        Ok(())
    }
}

/// Returns whether the cache entry of `asset_id` is complete.
pub fn is_cached(cache_root: impl AsRef<Path>, asset_id: &AssetId) -> bool {
    safe_join(cache_root.as_ref(), asset_id.as_str())
        .map(|path| path.join(ASSET_META_FILE_NAME).is_file())
        .unwrap_or(false)
}

/// Reads the completion marker of a cache entry directory.
pub fn read_entry_meta(cache_entry_path: impl AsRef<Path>) -> Result<CacheEntryMeta> {
    let path = cache_entry_path.as_ref().join(ASSET_META_FILE_NAME);
    let content = fs::read_to_string(&path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::IoError(err),
    })?;
    serde_yaml::from_str(&content).map_err(|err| Error::DecodeFailure {
        path,
        message: err.to_string(),
    })
}

/// Caches a single asset. The completion marker is only written when all files were written.
pub fn cache_asset(cache_root: &Path, asset_id: &AssetId, source_path: &Path, kind: Mode) -> Result<()> {
    if !asset_id.is_safe() {
        return Err(Error::InvalidPath(cache_root.join(asset_id.as_str())));
    }
    let cache_entry_path = cache_root.join(asset_id.as_str());
    fs::create_dir_all(&cache_entry_path)?;

    let mut asset_builder = AssetBuilder::new(asset_id, cache_entry_path);
    match kind {
        Mode::Image => {
            let image = ImageAsset::import(source_path)?;
            image_asset::cache_image(&mut asset_builder, &image)?;
        }
        Mode::Mesh => {
            let mesh = TriMesh::import(source_path)?;
            mesh_asset::cache_mesh(&mut asset_builder, &mesh)?;
        }
    }
    asset_builder.build(kind)
}

/// Determines how many assets are cached at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Serial,
    Parallel(usize),
}

impl Default for Concurrency {
    fn default() -> Self {
        Concurrency::Parallel(num_cpus::get())
    }
}

/// Outcome of a [`materialize`] run.
#[derive(Debug, Default)]
pub struct CacheReport {
    /// Assets that were cached in this run.
    pub cached: Vec<AssetId>,
    /// Assets that failed. They have no completion marker and are retried in the next run.
    pub failed: Vec<(AssetId, Error)>,
    pub elapsed: Duration,
}

impl CacheReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Caches every asset of the `table` that has no complete cache entry yet.
///
/// A failing asset is logged and reported but doesn't stop the other assets.
pub fn materialize(cache_root: impl AsRef<Path>, table: &AssetPathTable, kind: Mode, concurrency: Concurrency) -> Result<CacheReport> {
    let cache_root = cache_root.as_ref();
    let start = Instant::now();

    let uncached = table
        .iter()
        .filter(|(asset_id, _)| !is_cached(cache_root, asset_id))
        .collect::<Vec<_>>();
    if uncached.is_empty() {
        info!("All {} {kind} assets are cached", table.len());
        return Ok(CacheReport {
            elapsed: start.elapsed(),
            ..Default::default()
        });
    }
    info!("{} of {} {kind} assets need to be cached", uncached.len(), table.len());

    let n_uncached = uncached.len();
    let counter = AtomicUsize::new(0);
    let cache_one = |(asset_id, source_path): (&AssetId, &PathBuf)| {
        let index = counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Caching {index}/{n_uncached} - {asset_id}");
        let result = cache_asset(cache_root, asset_id, source_path, kind);
        match &result {
            Ok(()) => trace!("Successfully cached {asset_id}"),
            Err(err) => error!("Failed to cache {asset_id} from '{}': {err}", source_path.display()),
        }
        (asset_id.clone(), result)
    };

    let results = match concurrency {
        Concurrency::Serial => uncached.into_iter().map(cache_one).collect::<Vec<_>>(),
        Concurrency::Parallel(num_threads) => {
            let num_threads = num_threads.max(1);
            info!("Create thread pool with {num_threads} threads for caching");
            let thread_pool = ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .map_err(|_| Error::FailedToStartThreadPool)?;
            thread_pool.install(|| uncached.into_par_iter().map(cache_one).collect::<Vec<_>>())
        }
    };

    let mut report = CacheReport::default();
    for (asset_id, result) in results {
        match result {
            Ok(()) => report.cached.push(asset_id),
            Err(err) => report.failed.push((asset_id, err)),
        }
    }
    report.elapsed = start.elapsed();
    if report.is_success() {
        info!("Cached {} assets in {:.2?}", report.cached.len(), report.elapsed);
    } else {
        warn!(
            "Cached {} assets in {:.2?}, {} failed",
            report.cached.len(),
            report.elapsed,
            report.failed.len()
        );
    }
    Ok(report)
}

/// Everything that is needed to bring a cache directory up to date.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub asset_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub mode: Mode,
    pub pattern: ScanPattern,
    pub concurrency: Concurrency,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            asset_dir: PathBuf::from("."),
            cache_dir: PathBuf::from(CACHE_DIR_NAME),
            mode: Mode::Image,
            pattern: ScanPattern::default(),
            concurrency: Concurrency::default(),
        }
    }
}

impl CacheOptions {
    /// File names are only unique in a flat directory, so recursive scans use the relative path.
    pub fn identifier_strategy(&self, asset_dir: &Path) -> IdentifierStrategy {
        if self.pattern.recursive {
            IdentifierStrategy::RelativePath {
                root: asset_dir.to_owned(),
            }
        } else {
            IdentifierStrategy::FileName
        }
    }
}

/// Indexes the asset directory and caches everything that is missing.
///
/// Returns the absolute cache directory together with the asset table and the report.
pub fn build_cache(options: &CacheOptions) -> Result<(PathBuf, AssetPathTable, CacheReport)> {
    let asset_dir = asset_paths::ensure_asset_dir(&options.asset_dir)?;
    let cache_dir = asset_paths::ensure_cache_dir(&options.cache_dir)?;
    let identifier = options.identifier_strategy(&asset_dir);
    let pattern = options.pattern.clone().with_excluded_dir(&cache_dir);
    let table = asset_paths::index(&asset_dir, options.mode, &pattern, &identifier)?;
    let report = materialize(&cache_dir, &table, options.mode, options.concurrency)?;
    Ok((cache_dir, table, report))
}
