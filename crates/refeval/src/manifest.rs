//! Loading resource trees from YAML manifests
//!
//! A manifest describes one root resource and its subtree:
//! ```yaml
//! name: site
//! vars: {region: eu}
//! attributes:
//!   domain: example.com
//! resources:
//!   - name: web
//!     attributes:
//!       url: {ref: domain}
//! ```
//! Every loaded manifest adds another root to the same [ResourceTree].
use crate::eval::Vars;
use crate::resource::{ResourceId, ResourceTree, TreeError};
use crate::value::Map;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    pub name: String,
    #[serde(default)]
    pub attributes: Map,
    /// Bindings available while resolving the attributes
    #[serde(default)]
    pub vars: Vars,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("No manifests found in directory")]
    NoFilesFound,
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("Unable to parse manifest")]
    YamlParseFailed(#[from] serde_yaml::Error),
    #[error("Invalid resource tree")]
    Tree(#[from] TreeError),
}

impl ResourceTree {
    pub fn from_spec(spec: &ResourceSpec) -> Result<Self, TreeError> {
        let mut tree = ResourceTree::new();
        tree.insert_spec(spec, None)?;
        Ok(tree)
    }

    /// Adds `spec` and its subtree below `parent`
    pub fn insert_spec(
        &mut self,
        spec: &ResourceSpec,
        parent: Option<ResourceId>,
    ) -> Result<ResourceId, TreeError> {
        let id = self.add_resource(spec.name.clone(), &spec.attributes, parent)?;
        if !spec.vars.is_empty() {
            self.set_bindings(id, spec.vars.clone());
        }

        for child in &spec.resources {
            self.insert_spec(child, Some(id))?;
        }

        Ok(id)
    }

    pub fn load_file(&mut self, file_path: &Path) -> Result<ResourceId, LoadError> {
        let file_path = file_path.canonicalize()?;
        tracing::info!(path=%file_path.display(), "loading file");

        let file_contents = std::fs::read_to_string(&file_path)?;
        self.load_str(&file_contents)
    }

    /// Adds the manifest in `source` as a new root
    pub fn load_str(&mut self, source: &str) -> Result<ResourceId, LoadError> {
        let spec: ResourceSpec = serde_yaml::from_str(source)?;
        Ok(self.insert_spec(&spec, None)?)
    }

    /// Loads every `*refeval.yaml` file in `dir_path`, in file name order
    pub fn load_directory(&mut self, dir_path: &Path) -> Result<Vec<ResourceId>, LoadError> {
        let mut file_paths = vec![];
        for dir_entry in std::fs::read_dir(dir_path)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }

            let is_manifest = dir_entry
                .file_name()
                .to_string_lossy()
                .ends_with("refeval.yaml");
            if is_manifest {
                file_paths.push(dir_entry.path());
            }
        }

        if file_paths.is_empty() {
            return Err(LoadError::NoFilesFound);
        }

        file_paths.sort();
        file_paths
            .iter()
            .map(|file_path| self.load_file(file_path))
            .collect()
    }
}

pub fn from_yaml_str(source: &str) -> Result<ResourceTree, LoadError> {
    let mut tree = ResourceTree::new();
    tree.load_str(source)?;
    Ok(tree)
}

/// Utility macro to create a [ResourceTree] from YAML manifests
///
/// Create from a single manifest
/// ```
/// # use refeval::resource_tree;
/// let tree = resource_tree!("{name: test, attributes: {a: 1}}");
/// assert!(tree.find("test").is_some());
/// ```
///
/// Create from multiple manifests, each one a separate root
/// ```
/// # use refeval::resource_tree;
/// let tree = resource_tree! {
///   "{name: one}",
///   "{name: two, resources: [{name: three}]}"
/// };
/// assert_eq!(tree.len(), 3);
/// ```
///
/// # Panic
/// Panics on invalid input
///
/// ```should_panic
/// # use refeval::resource_tree;
/// resource_tree!("[not, a, manifest]");
/// ```
#[macro_export]
macro_rules! resource_tree {
    // single manifest
    { $expr:expr } => {
        $crate::manifest::from_yaml_str($expr).expect("manifest must load")
    };
    // several manifests
    { $($expr:expr),+ } => {{
        let mut tree = $crate::resource::ResourceTree::new();
        $(
            tree.load_str($expr).expect("manifest must load");
        )+

        tree
    }};
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::value::Value;
    use pretty_assertions::assert_eq;

    #[test]
    fn nested_resources() {
        let tree = resource_tree! {r#"
        name: site
        vars: {region: eu}
        attributes: {domain: example.com}
        resources:
          - name: web
            resources: [{name: static}]
          - name: db
        "#};

        let site = tree.find("site").unwrap();
        let web = tree.find("web").unwrap();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.children(site), &[web, tree.find("db").unwrap()]);
        assert_eq!(tree.parent(tree.find("static").unwrap()), Some(web));
        assert_eq!(
            tree.bindings(site).get("region"),
            Some(&Value::from("eu"))
        );
    }

    #[test]
    fn multiple_roots() {
        let tree = resource_tree! {
            "{name: one}",
            "{name: two}"
        };

        let one = tree.find("one").unwrap();
        let two = tree.find("two").unwrap();
        assert_eq!(tree.root(one), one);
        assert_eq!(tree.root(two), two);
    }

    #[test]
    fn load_errors() {
        assert!(matches!(
            from_yaml_str("{name: a, resources: [{name: a}]}"),
            Err(LoadError::Tree(TreeError::DuplicateName(name))) if name == "a"
        ));
        assert!(matches!(
            from_yaml_str("{name: a, children: []}"),
            Err(LoadError::YamlParseFailed(_))
        ));

        let mut tree = ResourceTree::new();
        assert!(matches!(
            tree.load_file(Path::new("surely/missing.refeval.yaml")),
            Err(LoadError::IoError(_))
        ));
        assert!(matches!(
            tree.load_directory(Path::new(env!("CARGO_MANIFEST_DIR"))),
            Err(LoadError::NoFilesFound)
        ));
    }
}
