//! Landmark templates describe which landmarks an annotation consists of. They are written in YAML:
//!
//! ```yaml
//! groups:
//!   - label: jaw
//!     points: 17
//!     connectivity:
//!       - 0:16
//!   - label: eye
//!     points: 6
//!     connectivity: cycle
//! ```
//!
//! An edge is either a pair `"a b"` or a slice `"a:b"` that connects all points from `a` to `b`.
//! `cycle` connects all points of the group in a closed loop. Indices are local to the group.
//!
//! Older installations used a plain text format (`.txt`) with one block per group:
//!
//! ```text
//! jaw 17
//! 0:16
//!
//! eye 6
//! 0 1
//! ```
//!
//! Those files are only read by [`upgrade_legacy_templates`] which writes the YAML version next to them.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    result,
};

use landmarker_shared::{
    log::{debug, info, warn},
    serde_json::{self, json},
    serde_yaml, thiserror,
};
use serde::{Deserialize, Serialize};

use crate::{
    common::{extract_file_stem_from_path, is_safe_name, LEGACY_TEMPLATE_EXTENSION, TEMPLATE_EXTENSION},
    Error, Result,
};

/// Version of the landmark JSON that is produced for the skeletons.
pub const LANDMARK_JSON_VERSION: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Failed to parse YAML: {0}")]
    Yaml(String),
    #[error("Missing 'groups' key")]
    MissingGroups,
    #[error("Group {0} has no 'points' key")]
    MissingPoints(usize),
    #[error("Malformed group header '{0}' - expected '<label> <points>'")]
    MalformedHeader(String),
    #[error("Malformed connectivity '{0}'")]
    MalformedConnectivity(String),
    #[error("Edge ({a}, {b}) is out of range for a group with {n} points")]
    EdgeOutOfRange { a: usize, b: usize, n: usize },
}

impl TemplateError {
    pub fn into_error(self, template_id: impl Into<String>) -> Error {
        Error::InvalidTemplate {
            template_id: template_id.into(),
            message: self.to_string(),
        }
    }
}

/// A labelled set of points with edges between them. The edges use group-local indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub label: String,
    pub n_points: usize,
    pub connectivity: Vec<[usize; 2]>,
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    groups: Option<Vec<RawGroup>>,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    label: Option<serde_yaml::Value>,
    points: Option<usize>,
    connectivity: Option<serde_yaml::Value>,
}

#[derive(Debug, Serialize)]
struct TemplateFile {
    groups: Vec<GroupFile>,
}

#[derive(Debug, Serialize)]
struct GroupFile {
    label: String,
    points: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    connectivity: Vec<String>,
}

/// Parses a single connectivity entry and appends the edges.
fn parse_edge(entry: &str, edges: &mut Vec<[usize; 2]>) -> result::Result<(), TemplateError> {
    let malformed = || TemplateError::MalformedConnectivity(entry.to_owned());
    let parse_index = |s: &str| s.trim().parse::<usize>().map_err(|_| malformed());
    if let Some((start, end)) = entry.split_once(':') {
        let (start, end) = (parse_index(start)?, parse_index(end)?);
        edges.extend((start..end).map(|i| [i, i + 1]));
    } else {
        let mut parts = entry.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), None) => edges.push([parse_index(a)?, parse_index(b)?]),
            _ => return Err(malformed()),
        }
    }
    Ok(())
}

/// Parses a list of `"a b"` and `"a:b"` entries and checks that all indices are smaller than `n`.
pub fn parse_connectivity<S: AsRef<str>>(entries: &[S], n: usize) -> result::Result<Vec<[usize; 2]>, TemplateError> {
    let mut edges = Vec::new();
    for entry in entries {
        parse_edge(entry.as_ref(), &mut edges)?;
    }
    if let Some(&[a, b]) = edges.iter().find(|[a, b]| *a >= n || *b >= n) {
        return Err(TemplateError::EdgeOutOfRange { a, b, n });
    }
    Ok(edges)
}

/// Closed loop over `n` points. Groups with less than two points have no edges.
pub fn cycle(n: usize) -> Vec<[usize; 2]> {
    if n < 2 {
        return Vec::new();
    }
    (0..n).map(|i| [i, (i + 1) % n]).collect()
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(number) => Some(number.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parses the groups of a YAML template.
pub fn parse_yaml_groups(source: &str) -> result::Result<Vec<Group>, TemplateError> {
    let raw: RawTemplate = serde_yaml::from_str(source).map_err(|err| TemplateError::Yaml(err.to_string()))?;
    let raw_groups = raw.groups.ok_or(TemplateError::MissingGroups)?;

    let mut groups = Vec::with_capacity(raw_groups.len());
    for (index, raw_group) in raw_groups.into_iter().enumerate() {
        let label = raw_group
            .label
            .as_ref()
            .and_then(yaml_scalar_to_string)
            .unwrap_or_else(|| index.to_string());
        let n_points = raw_group.points.ok_or(TemplateError::MissingPoints(index))?;
        let connectivity = match &raw_group.connectivity {
            Some(serde_yaml::Value::Sequence(entries)) => {
                let entries = entries
                    .iter()
                    .map(|entry| yaml_scalar_to_string(entry).ok_or_else(|| TemplateError::MalformedConnectivity(format!("{entry:?}"))))
                    .collect::<result::Result<Vec<_>, _>>()?;
                parse_connectivity(&entries, n_points)?
            }
            Some(serde_yaml::Value::String(token)) if token == "cycle" => cycle(n_points),
            // Anything else can't be interpreted and results in a group without edges.
            _ => Vec::new(),
        };
        groups.push(Group {
            label,
            n_points,
            connectivity,
        });
    }
    Ok(groups)
}

/// Parses the groups of a legacy plain text template.
pub fn parse_legacy_groups(source: &str) -> result::Result<Vec<Group>, TemplateError> {
    let mut blocks: Vec<Vec<&str>> = vec![Vec::new()];
    for line in source.lines().map(str::trim) {
        if line.is_empty() {
            if blocks.last().is_some_and(|block| !block.is_empty()) {
                blocks.push(Vec::new());
            }
        } else if let Some(block) = blocks.last_mut() {
            block.push(line);
        }
    }

    let mut groups = Vec::new();
    for block in blocks.into_iter().filter(|block| !block.is_empty()) {
        let header = block[0];
        let mut parts = header.split_whitespace();
        let (label, n_points) = match (parts.next(), parts.next().map(str::parse::<usize>), parts.next()) {
            (Some(label), Some(Ok(n_points)), None) => (label.to_owned(), n_points),
            _ => return Err(TemplateError::MalformedHeader(header.to_owned())),
        };
        let connectivity = parse_connectivity(&block[1..], n_points)?;
        groups.push(Group {
            label,
            n_points,
            connectivity,
        });
    }
    Ok(groups)
}

/// Builds the empty landmark JSON for the given groups.
///
/// # Example
///
/// ```rust
/// use landmarker_content::template::{build_skeleton, Group};
///
/// let groups = vec![Group { label: "nose".to_owned(), n_points: 2, connectivity: vec![[0, 1]] }];
/// let skeleton = build_skeleton(&groups, 2);
/// assert_eq!(skeleton["landmarks"]["points"].as_array().unwrap().len(), 2);
/// assert_eq!(skeleton["version"], 2);
/// ```
pub fn build_skeleton(groups: &[Group], n_dims: usize) -> serde_json::Value {
    let mut offset = 0;
    let mut connectivity = Vec::new();
    let mut labels = Vec::new();
    for group in groups {
        connectivity.extend(group.connectivity.iter().map(|[a, b]| [a + offset, b + offset]));
        labels.push(json!({
            "label": group.label,
            "mask": (offset..offset + group.n_points).collect::<Vec<_>>(),
        }));
        offset += group.n_points;
    }
    let points = vec![vec![serde_json::Value::Null; n_dims]; offset];
    json!({
        "labels": labels,
        "landmarks": {
            "connectivity": connectivity,
            "points": points,
        },
        "version": LANDMARK_JSON_VERSION,
    })
}

/// Parses a YAML template and builds its skeleton.
pub fn parse_yaml_template(source: &str, n_dims: usize) -> result::Result<serde_json::Value, TemplateError> {
    Ok(build_skeleton(&parse_yaml_groups(source)?, n_dims))
}

/// Parses a legacy plain text template and builds its skeleton.
pub fn parse_legacy_template(source: &str, n_dims: usize) -> result::Result<serde_json::Value, TemplateError> {
    Ok(build_skeleton(&parse_legacy_groups(source)?, n_dims))
}

/// Renders groups in the YAML template format.
pub fn groups_to_yaml(groups: &[Group]) -> Result<String> {
    let template_file = TemplateFile {
        groups: groups
            .iter()
            .map(|group| GroupFile {
                label: group.label.clone(),
                points: group.n_points,
                connectivity: group.connectivity.iter().map(|[a, b]| format!("{a} {b}")).collect(),
            })
            .collect(),
    };
    serde_yaml::to_string(&template_file).map_err(|err| Error::Other(Box::new(err)))
}

fn paths_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == extension) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Writes a YAML template next to every legacy template in `template_dir`. Existing YAML templates
/// are never overwritten. Returns the paths of the written files.
pub fn upgrade_legacy_templates(template_dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let template_dir = template_dir.as_ref();
    let mut written = Vec::new();
    for legacy_path in paths_with_extension(template_dir, LEGACY_TEMPLATE_EXTENSION)? {
        let yaml_path = legacy_path.with_extension(TEMPLATE_EXTENSION);
        if yaml_path.exists() {
            info!("Skipping '{}' because '{}' exists already", legacy_path.display(), yaml_path.display());
            continue;
        }
        let template_id = extract_file_stem_from_path(&legacy_path)?;
        let source = fs::read_to_string(&legacy_path)?;
        let groups = match parse_legacy_groups(&source) {
            Ok(groups) => groups,
            Err(err) => {
                warn!("Failed to upgrade template '{template_id}': {err}");
                continue;
            }
        };
        fs::write(&yaml_path, groups_to_yaml(&groups)?)?;
        info!("Upgraded template '{template_id}' to '{}'", yaml_path.display());
        written.push(yaml_path);
    }
    Ok(written)
}

/// Source of landmark templates.
pub trait TemplateStore: Send + Sync {
    fn template_ids(&self) -> Vec<String>;
    /// Returns the empty landmark JSON of the template.
    fn load_template(&self, template_id: &str) -> Result<serde_json::Value>;
}

/// Reads every YAML template of a directory once at startup.
#[derive(Debug)]
pub struct FileTemplateStore {
    template_dir: PathBuf,
    templates: BTreeMap<String, serde_json::Value>,
    /// Templates that failed to parse together with the reason.
    invalid: BTreeMap<String, String>,
}

impl FileTemplateStore {
    /// Loads all templates in `template_dir`. Templates that can't be parsed are logged and
    /// reported as [`Error::InvalidTemplate`] when they are requested.
    pub fn new(template_dir: impl Into<PathBuf>, n_dims: usize) -> Result<Self> {
        let template_dir = template_dir.into();
        if !template_dir.is_dir() {
            return Err(Error::InvalidPath(template_dir));
        }
        debug!("templates: {}", template_dir.display());

        for legacy_path in paths_with_extension(&template_dir, LEGACY_TEMPLATE_EXTENSION)? {
            if !legacy_path.with_extension(TEMPLATE_EXTENSION).exists() {
                warn!(
                    "Ignoring legacy template '{}'. Run the 'upgrade-templates' command to convert it.",
                    legacy_path.display()
                );
            }
        }

        let mut templates = BTreeMap::new();
        let mut invalid = BTreeMap::new();
        for path in paths_with_extension(&template_dir, TEMPLATE_EXTENSION)? {
            let template_id = extract_file_stem_from_path(&path)?;
            match load_template_file(&path, n_dims) {
                Ok(skeleton) => {
                    templates.insert(template_id, skeleton);
                }
                Err(Error::InvalidTemplate { message, .. }) => {
                    warn!("Invalid template '{template_id}': {message}");
                    invalid.insert(template_id, message);
                }
                Err(err) => warn!("Failed to read template '{}': {err}", path.display()),
            }
        }
        info!(
            "Cached {} templates ({})",
            templates.len(),
            templates.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        Ok(Self {
            template_dir,
            templates,
            invalid,
        })
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }
}

impl TemplateStore for FileTemplateStore {
    fn template_ids(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    fn load_template(&self, template_id: &str) -> Result<serde_json::Value> {
        if !is_safe_name(template_id) {
            return Err(Error::NotFound(template_id.to_owned()));
        }
        if let Some(message) = self.invalid.get(template_id) {
            return Err(Error::InvalidTemplate {
                template_id: template_id.to_owned(),
                message: message.clone(),
            });
        }
        self.templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("template '{template_id}'")))
    }
}

/// Reads a single template file from disk. Fails with [`Error::NotFound`] if it doesn't exist.
pub fn load_template_file(path: impl AsRef<Path>, n_dims: usize) -> Result<serde_json::Value> {
    let path = path.as_ref();
    let template_id = extract_file_stem_from_path(path)?;
    let source = fs::read_to_string(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::IoError(err),
    })?;
    parse_yaml_template(&source, n_dims).map_err(|err| err.into_error(template_id))
}

#[cfg(test)]
mod tests {
    use landmarker_shared::indoc::indoc;
    use landmarker_test::setup_logger;
    use tempdir::TempDir;

    use super::*;

    const FACE: &str = indoc! {"
        groups:
          - label: jaw
            points: 5
            connectivity: cycle
          - label: eye
            points: 3
            connectivity: []
    "};

    #[test]
    fn jaw_and_eye() {
        // When
        let skeleton = parse_yaml_template(FACE, 2).unwrap();

        // Then
        let points = skeleton["landmarks"]["points"].as_array().unwrap();
        assert_eq!(points.len(), 8);
        assert!(points.iter().all(|point| point == &json!([null, null])));
        assert_eq!(
            skeleton["landmarks"]["connectivity"],
            json!([[0, 1], [1, 2], [2, 3], [3, 4], [4, 0]])
        );
        assert_eq!(
            skeleton["labels"],
            json!([
                {"label": "jaw", "mask": [0, 1, 2, 3, 4]},
                {"label": "eye", "mask": [5, 6, 7]},
            ])
        );
        assert_eq!(skeleton["version"], json!(2));
    }

    #[test]
    fn slice_expands_to_consecutive_edges() {
        assert_eq!(parse_connectivity(&["0:3"], 5).unwrap(), vec![[0, 1], [1, 2], [2, 3]]);
    }

    #[test]
    fn edge_out_of_range() {
        assert!(matches!(
            parse_connectivity(&["0 5"], 5),
            Err(TemplateError::EdgeOutOfRange { a: 0, b: 5, n: 5 })
        ));
        assert!(parse_connectivity(&["3:5"], 5).is_err());
        assert!(parse_connectivity(&["0 4"], 5).is_ok());
    }

    #[test]
    fn malformed_connectivity() {
        assert!(matches!(parse_connectivity(&["0 1 2"], 5), Err(TemplateError::MalformedConnectivity(_))));
        assert!(matches!(parse_connectivity(&["-1 0"], 5), Err(TemplateError::MalformedConnectivity(_))));
    }

    #[test]
    fn labels_default_to_group_index() {
        let source = indoc! {"
            groups:
              - points: 2
                connectivity: [\"0 1\"]
              - points: 1
                connectivity: whatever
        "};
        let groups = parse_yaml_groups(source).unwrap();
        assert_eq!(groups[0].label, "0");
        assert_eq!(groups[0].connectivity, vec![[0, 1]]);
        assert_eq!(groups[1].label, "1");
        assert!(groups[1].connectivity.is_empty());
    }

    #[test]
    fn missing_keys() {
        assert!(matches!(parse_yaml_groups("template: []"), Err(TemplateError::MissingGroups)));
        assert!(matches!(
            parse_yaml_groups("groups:\n  - label: nose\n"),
            Err(TemplateError::MissingPoints(0))
        ));
    }

    #[test]
    fn legacy_format() {
        let source = "jaw 5\n0:4\n\neye 3\n0 1\n1 2\n";
        let groups = parse_legacy_groups(source).unwrap();
        assert_eq!(
            groups,
            vec![
                Group {
                    label: "jaw".to_owned(),
                    n_points: 5,
                    connectivity: vec![[0, 1], [1, 2], [2, 3], [3, 4]],
                },
                Group {
                    label: "eye".to_owned(),
                    n_points: 3,
                    connectivity: vec![[0, 1], [1, 2]],
                },
            ]
        );
        assert!(matches!(parse_legacy_groups("jaw\n0 1\n"), Err(TemplateError::MalformedHeader(_))));
    }

    #[test]
    fn upgrade_writes_yaml_next_to_legacy_templates() {
        setup_logger();
        let root = TempDir::new("templates").unwrap();
        fs::write(root.path().join("face.txt"), "jaw 5\n0:4\n\neye 3\n").unwrap();
        fs::write(root.path().join("kept.txt"), "nose 2\n0 1\n").unwrap();
        fs::write(root.path().join("kept.yml"), "groups:\n  - points: 1\n").unwrap();

        // When
        let written = upgrade_legacy_templates(root.path()).unwrap();

        // Then
        assert_eq!(written, vec![root.path().join("face.yml")]);
        let upgraded = parse_yaml_groups(&fs::read_to_string(root.path().join("face.yml")).unwrap()).unwrap();
        assert_eq!(upgraded, parse_legacy_groups("jaw 5\n0:4\n\neye 3\n").unwrap());
        assert_eq!(fs::read_to_string(root.path().join("kept.yml")).unwrap(), "groups:\n  - points: 1\n");
    }

    #[test]
    fn store_reports_malformed_and_skips_legacy_templates() {
        setup_logger();
        let root = TempDir::new("templates").unwrap();
        fs::write(root.path().join("face.yml"), FACE).unwrap();
        fs::write(root.path().join("broken.yml"), "groups:\n  - label: x\n    points: 2\n    connectivity: ['0 7']\n").unwrap();
        fs::write(root.path().join("legacy.txt"), "jaw 5\n").unwrap();

        let store = FileTemplateStore::new(root.path(), 3).unwrap();

        assert_eq!(store.template_ids(), vec!["face".to_owned()]);
        let skeleton = store.load_template("face").unwrap();
        assert_eq!(skeleton["landmarks"]["points"][0], json!([null, null, null]));
        assert!(matches!(
            store.load_template("broken"),
            Err(Error::InvalidTemplate { template_id, message }) if template_id == "broken" && message.contains("out of range")
        ));
        assert!(store.load_template("legacy").unwrap_err().is_not_found());
        assert!(store.load_template("../face").unwrap_err().is_not_found());
    }

    #[test]
    fn load_single_template_file() {
        let root = TempDir::new("templates").unwrap();
        fs::write(root.path().join("broken.yml"), "groups:\n  - points: 2\n    connectivity: ['1 2']\n").unwrap();

        assert!(load_template_file(root.path().join("missing.yml"), 2).unwrap_err().is_not_found());
        assert!(matches!(
            load_template_file(root.path().join("broken.yml"), 2),
            Err(Error::InvalidTemplate { template_id, .. }) if template_id == "broken"
        ));
    }
}
