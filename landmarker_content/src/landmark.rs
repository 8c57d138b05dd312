use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use landmarker_shared::{
    log::{debug, info, trace, warn},
    serde_json::{self, ser::PrettyFormatter, Serializer},
};
use serde::Serialize;

use crate::{
    asset_paths::AssetPathTable,
    common::{extract_file_stem_from_path, safe_join, LANDMARK_EXTENSION},
    template::TemplateStore,
    Error, Result,
};

/// Landmark id of the landmarks that are stored next to the asset by [`InplaceLandmarkStore`].
pub const INPLACE_LANDMARK_ID: &str = "inplace";

/// Persistent storage of the landmark JSON per asset and landmark id.
pub trait LandmarkStore: Send + Sync {
    /// All assets that have landmarks together with their landmark ids.
    fn asset_id_to_landmark_ids(&self) -> Result<BTreeMap<String, Vec<String>>>;
    fn landmark_ids(&self, asset_id: &str) -> Result<Vec<String>>;
    fn load_landmark(&self, asset_id: &str, landmark_id: &str) -> Result<serde_json::Value>;
    fn save_landmark(&self, asset_id: &str, landmark_id: &str, landmark: &serde_json::Value) -> Result<()>;
}

/// Reads a landmark file. Fails with [`Error::NotFound`] if it doesn't exist.
pub fn read_landmark_file(path: impl AsRef<Path>) -> Result<serde_json::Value> {
    let path = path.as_ref();
    let content = fs::read(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::IoError(err),
    })?;
    serde_json::from_slice(&content).map_err(|err| Error::DecodeFailure {
        path: path.to_owned(),
        message: err.to_string(),
    })
}

/// Writes the landmark JSON with sorted keys and an indentation of four spaces.
///
/// The JSON is written to a sibling `.tmp` file first which then replaces `path`, so an existing
/// landmark file is never left truncated.
pub fn write_landmark_file(path: impl AsRef<Path>, landmark: &serde_json::Value) -> io::Result<()> {
    let path = path.as_ref();
    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    let written = write_pretty_json(&temp_path, landmark).and_then(|_| fs::rename(&temp_path, path));
    if written.is_err() && temp_path.exists() {
        if let Err(err) = fs::remove_file(&temp_path) {
            warn!("Failed to remove '{}': {err}", temp_path.display());
        }
    }
    written
}

fn write_pretty_json(path: &Path, landmark: &serde_json::Value) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut serializer = Serializer::with_formatter(&mut writer, PrettyFormatter::with_indent(b"    "));
    landmark.serialize(&mut serializer).map_err(io::Error::from)?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

fn save_conflict(asset_id: &str, landmark_id: &str, message: impl ToString) -> Error {
    Error::SaveConflict {
        asset_id: asset_id.to_owned(),
        landmark_id: landmark_id.to_owned(),
        message: message.to_string(),
    }
}

/// Stores landmarks in `<landmark_dir>/<asset_id>/<landmark_id>.ljson`.
#[derive(Debug, Clone)]
pub struct SeparateDirLandmarkStore {
    landmark_dir: PathBuf,
}

impl SeparateDirLandmarkStore {
    /// Creates the landmark directory if it doesn't exist.
    pub fn new(landmark_dir: impl Into<PathBuf>) -> Result<Self> {
        let landmark_dir = landmark_dir.into();
        if !landmark_dir.is_dir() {
            warn!("The landmark dir does not exist - creating {}", landmark_dir.display());
            fs::create_dir_all(&landmark_dir)?;
        }
        debug!("landmarks: {}", landmark_dir.display());
        Ok(Self { landmark_dir })
    }

    pub fn landmark_dir(&self) -> &Path {
        &self.landmark_dir
    }

    fn landmark_path(&self, asset_id: &str, landmark_id: &str) -> Result<PathBuf> {
        let asset_dir = safe_join(&self.landmark_dir, asset_id)?;
        safe_join(&asset_dir, &format!("{landmark_id}.{LANDMARK_EXTENSION}"))
    }

    fn landmark_ids_in(asset_dir: &Path) -> Result<Vec<String>> {
        let mut landmark_ids = Vec::new();
        for entry in fs::read_dir(asset_dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == LANDMARK_EXTENSION) {
                landmark_ids.push(extract_file_stem_from_path(&path)?);
            }
        }
        landmark_ids.sort();
        Ok(landmark_ids)
    }
}

impl LandmarkStore for SeparateDirLandmarkStore {
    fn asset_id_to_landmark_ids(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let mut mapping = BTreeMap::new();
        for entry in fs::read_dir(&self.landmark_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(asset_id) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let landmark_ids = Self::landmark_ids_in(&entry.path())?;
            if !landmark_ids.is_empty() {
                mapping.insert(asset_id, landmark_ids);
            }
        }
        Ok(mapping)
    }

    /// Assets without landmarks have no landmark ids.
    fn landmark_ids(&self, asset_id: &str) -> Result<Vec<String>> {
        let asset_dir = safe_join(&self.landmark_dir, asset_id)?;
        if !asset_dir.is_dir() {
            return Ok(Vec::new());
        }
        Self::landmark_ids_in(&asset_dir)
    }

    fn load_landmark(&self, asset_id: &str, landmark_id: &str) -> Result<serde_json::Value> {
        read_landmark_file(self.landmark_path(asset_id, landmark_id)?)
    }

    fn save_landmark(&self, asset_id: &str, landmark_id: &str, landmark: &serde_json::Value) -> Result<()> {
        let path = self
            .landmark_path(asset_id, landmark_id)
            .map_err(|err| save_conflict(asset_id, landmark_id, err))?;
        if let Some(asset_dir) = path.parent() {
            fs::create_dir_all(asset_dir).map_err(|err| save_conflict(asset_id, landmark_id, err))?;
        }
        write_landmark_file(&path, landmark).map_err(|err| save_conflict(asset_id, landmark_id, err))?;
        trace!("Saved landmarks to '{}'", path.display());
        Ok(())
    }
}

/// Stores the landmarks of an asset next to the asset file with the extension `.ljson`. Every
/// asset has at most one set of landmarks which is reported as [`INPLACE_LANDMARK_ID`].
#[derive(Debug, Clone)]
pub struct InplaceLandmarkStore {
    asset_paths: AssetPathTable,
}

impl InplaceLandmarkStore {
    /// Assets whose files only differ in the extension share a landmark file, which is reported
    /// with a warning.
    pub fn new(asset_paths: AssetPathTable) -> Self {
        for (landmark_path, asset_ids) in shared_landmark_paths(&asset_paths) {
            warn!(
                "Assets {} share the landmark file '{}'",
                asset_ids.join(", "),
                landmark_path.display()
            );
        }
        let store = Self { asset_paths };
        let n_with_landmarks = store
            .asset_paths
            .values()
            .filter(|path| Self::landmark_path_for(path).is_file())
            .count();
        info!("Landmarks served inplace - found {n_with_landmarks} assets with landmarks");
        store
    }

    fn landmark_path_for(asset_path: &Path) -> PathBuf {
        asset_path.with_extension(LANDMARK_EXTENSION)
    }

    /// The landmark id is ignored because there is only one landmark file per asset.
    fn landmark_path(&self, asset_id: &str) -> Result<PathBuf> {
        self.asset_paths
            .get(asset_id)
            .map(|asset_path| Self::landmark_path_for(asset_path))
            .ok_or_else(|| Error::NotFound(format!("Unable to find landmark ids for '{asset_id}'")))
    }
}

/// Landmark files that more than one asset maps to, e.g. `face.jpg` and `face.png`.
fn shared_landmark_paths(asset_paths: &AssetPathTable) -> BTreeMap<PathBuf, Vec<String>> {
    let mut by_landmark_path: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
    for (asset_id, asset_path) in asset_paths.iter() {
        by_landmark_path
            .entry(InplaceLandmarkStore::landmark_path_for(asset_path))
            .or_default()
            .push(asset_id.to_string());
    }
    by_landmark_path.retain(|_, asset_ids| asset_ids.len() > 1);
    by_landmark_path
}

impl LandmarkStore for InplaceLandmarkStore {
    fn asset_id_to_landmark_ids(&self) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(self
            .asset_paths
            .iter()
            .filter(|(_, path)| Self::landmark_path_for(path).is_file())
            .map(|(asset_id, _)| (asset_id.to_string(), vec![INPLACE_LANDMARK_ID.to_owned()]))
            .collect())
    }

    fn landmark_ids(&self, asset_id: &str) -> Result<Vec<String>> {
        self.landmark_path(asset_id)?;
        Ok(vec![INPLACE_LANDMARK_ID.to_owned()])
    }

    fn load_landmark(&self, asset_id: &str, _landmark_id: &str) -> Result<serde_json::Value> {
        read_landmark_file(self.landmark_path(asset_id)?)
    }

    fn save_landmark(&self, asset_id: &str, landmark_id: &str, landmark: &serde_json::Value) -> Result<()> {
        let path = self
            .landmark_path(asset_id)
            .map_err(|err| save_conflict(asset_id, landmark_id, err))?;
        write_landmark_file(&path, landmark).map_err(|err| save_conflict(asset_id, landmark_id, err))
    }
}

/// Loads the landmarks of an asset. When the asset has no such landmarks yet, the empty skeleton of
/// the template with the same id is returned. Errors other than [`Error::NotFound`] are not masked.
pub fn load_landmark_or_template(
    landmarks: &dyn LandmarkStore,
    templates: &dyn TemplateStore,
    asset_id: &str,
    landmark_id: &str,
) -> Result<serde_json::Value> {
    match landmarks.load_landmark(asset_id, landmark_id) {
        Ok(landmark) => Ok(landmark),
        Err(err) if err.is_not_found() => {
            debug!("No landmarks {asset_id}/{landmark_id} - falling back to the template");
            templates.load_template(landmark_id).map_err(|err| match err {
                Error::NotFound(_) => Error::NotFound(format!(
                    "{asset_id} does not have {landmark_id} landmarks and no valid template found"
                )),
                err => err,
            })
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use landmarker_shared::{indoc::indoc, serde_json::json};
    use landmarker_test::setup_logger;
    use tempdir::TempDir;

    use super::*;
    use crate::{template::FileTemplateStore, AssetId};

    fn face_landmarks() -> serde_json::Value {
        json!({
            "version": 2,
            "labels": [{"label": "nose", "mask": [0, 1]}],
            "landmarks": {
                "points": [[1.5, 2.0], [null, null]],
                "connectivity": [[0, 1]],
            },
        })
    }

    fn template_store(root: &Path) -> FileTemplateStore {
        let template_dir = root.join("templates");
        fs::create_dir_all(&template_dir).unwrap();
        fs::write(template_dir.join("nose.yml"), "groups:\n  - label: nose\n    points: 2\n").unwrap();
        FileTemplateStore::new(template_dir, 2).unwrap()
    }

    #[test]
    fn save_then_load() {
        setup_logger();
        let root = TempDir::new("landmarks").unwrap();
        let store = SeparateDirLandmarkStore::new(root.path().join("lmiolandmarks")).unwrap();

        // When
        store.save_landmark("face01", "manual", &face_landmarks()).unwrap();

        // Then
        assert_eq!(store.load_landmark("face01", "manual").unwrap(), face_landmarks());
        assert_eq!(store.landmark_ids("face01").unwrap(), vec!["manual".to_owned()]);
        assert!(store.landmark_ids("face02").unwrap().is_empty());
        let mapping = store.asset_id_to_landmark_ids().unwrap();
        assert_eq!(mapping.get("face01"), Some(&vec!["manual".to_owned()]));
    }

    #[test]
    fn file_has_sorted_keys_and_four_space_indent() {
        let root = TempDir::new("landmarks").unwrap();
        let path = root.path().join("face.ljson");

        write_landmark_file(&path, &json!({"version": 2, "labels": [], "a": {"z": null, "b": 1}})).unwrap();

        let expected = indoc! {r#"
            {
                "a": {
                    "b": 1,
                    "z": null
                },
                "labels": [],
                "version": 2
            }"#};
        assert_eq!(fs::read_to_string(&path).unwrap(), expected);
    }

    #[test]
    fn existing_file_is_replaced_without_leftovers() {
        setup_logger();
        let root = TempDir::new("landmarks").unwrap();
        let path = root.path().join("face.ljson");

        // Given
        write_landmark_file(&path, &json!({"version": 1, "labels": ["a much longer previous value"]})).unwrap();

        // When
        write_landmark_file(&path, &face_landmarks()).unwrap();

        // Then
        assert_eq!(read_landmark_file(&path).unwrap(), face_landmarks());
        let file_names = fs::read_dir(root.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect::<Vec<_>>();
        assert_eq!(file_names, vec![std::ffi::OsString::from("face.ljson")]);
    }

    #[test]
    fn failed_write_keeps_the_existing_file() {
        setup_logger();
        let root = TempDir::new("landmarks").unwrap();
        let path = root.path().join("face.ljson");
        write_landmark_file(&path, &face_landmarks()).unwrap();

        // Given a directory where the temporary file would be written
        fs::create_dir(root.path().join("face.ljson.tmp")).unwrap();

        // When
        let result = write_landmark_file(&path, &json!({"version": 2, "labels": []}));

        // Then
        assert!(result.is_err());
        assert_eq!(read_landmark_file(&path).unwrap(), face_landmarks());
    }

    #[test]
    fn missing_landmarks_are_not_found() {
        let root = TempDir::new("landmarks").unwrap();
        let store = SeparateDirLandmarkStore::new(root.path()).unwrap();
        assert!(store.load_landmark("face01", "manual").unwrap_err().is_not_found());
        assert!(store.load_landmark("..", "manual").unwrap_err().is_not_found());
    }

    #[test]
    fn unsafe_ids_can_not_be_saved() {
        let root = TempDir::new("landmarks").unwrap();
        let store = SeparateDirLandmarkStore::new(root.path()).unwrap();
        let result = store.save_landmark("../outside", "manual", &face_landmarks());
        assert!(matches!(result, Err(Error::SaveConflict { .. })));
    }

    #[test]
    fn inplace_store() {
        setup_logger();
        let root = TempDir::new("landmarks").unwrap();
        let mut table = AssetPathTable::new();
        table.insert(AssetId::new("face01"), root.path().join("face01.jpg"));
        table.insert(AssetId::new("face02"), root.path().join("face02.jpg"));
        let store = InplaceLandmarkStore::new(table);

        // Given
        store.save_landmark("face01", INPLACE_LANDMARK_ID, &face_landmarks()).unwrap();

        // Then
        assert!(root.path().join("face01.ljson").is_file());
        assert_eq!(store.load_landmark("face01", INPLACE_LANDMARK_ID).unwrap(), face_landmarks());
        assert_eq!(store.asset_id_to_landmark_ids().unwrap().len(), 1);
        assert_eq!(store.landmark_ids("face02").unwrap(), vec![INPLACE_LANDMARK_ID.to_owned()]);
        assert!(store.landmark_ids("face03").unwrap_err().is_not_found());
        assert!(store.load_landmark("face02", INPLACE_LANDMARK_ID).unwrap_err().is_not_found());
    }

    #[test]
    fn inplace_assets_differing_in_extension_share_a_landmark_file() {
        setup_logger();
        let root = TempDir::new("landmarks").unwrap();
        let mut table = AssetPathTable::new();
        table.insert(AssetId::new("face"), root.path().join("face.jpg"));
        table.insert(AssetId::new("face_png"), root.path().join("face.png"));
        table.insert(AssetId::new("other"), root.path().join("other.jpg"));

        // When
        let shared = shared_landmark_paths(&table);

        // Then
        assert_eq!(shared.len(), 1);
        assert_eq!(
            shared.get(&root.path().join("face.ljson")),
            Some(&vec!["face".to_owned(), "face_png".to_owned()])
        );
        let store = InplaceLandmarkStore::new(table);
        store.save_landmark("face", INPLACE_LANDMARK_ID, &face_landmarks()).unwrap();
        assert_eq!(store.load_landmark("face_png", INPLACE_LANDMARK_ID).unwrap(), face_landmarks());
    }

    #[test]
    fn fallback_to_template() {
        setup_logger();
        let root = TempDir::new("landmarks").unwrap();
        let landmarks = SeparateDirLandmarkStore::new(root.path().join("lmiolandmarks")).unwrap();
        let templates = template_store(root.path());

        // Missing landmarks use the template
        let skeleton = load_landmark_or_template(&landmarks, &templates, "face01", "nose").unwrap();
        assert_eq!(skeleton["labels"][0]["mask"], json!([0, 1]));

        // Saved landmarks win over the template
        landmarks.save_landmark("face01", "nose", &face_landmarks()).unwrap();
        let loaded = load_landmark_or_template(&landmarks, &templates, "face01", "nose").unwrap();
        assert_eq!(loaded, face_landmarks());

        // Neither landmarks nor template
        let err = load_landmark_or_template(&landmarks, &templates, "face01", "ibug68").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn broken_landmarks_are_not_masked_by_the_template() {
        setup_logger();
        let root = TempDir::new("landmarks").unwrap();
        let landmarks = SeparateDirLandmarkStore::new(root.path().join("lmiolandmarks")).unwrap();
        let templates = template_store(root.path());
        fs::create_dir_all(root.path().join("lmiolandmarks/face01")).unwrap();
        fs::write(root.path().join("lmiolandmarks/face01/nose.ljson"), "{ not json").unwrap();

        let result = load_landmark_or_template(&landmarks, &templates, "face01", "nose");
        assert!(matches!(result, Err(Error::DecodeFailure { .. })));
    }
}
