//! The resource graph
//!
//! [ResourceTree] owns every resource in an arena and hands out [ResourceId]s. A resource
//! has a name (unique within the tree), at most one parent and a [ResultStore] with its
//! attributes. The tree also carries the evaluation environment: templater, external
//! sources and [Limits].
//!
//! Path keys on a resource resolve in this order:
//! 1. properties: `.`, `..`, `.name`, `.parents`, `.ancestors`, `.root`, `.children`,
//!    `.descendants` (also spelled `.descendents`), `.named`
//! 2. the resource's own attributes
//! 3. attributes inherited from its parents, nearest first
//! 4. the resource with that name, anywhere in the tree
use crate::error::Error;
use crate::eval::{EvalContext, ResolveByName, Vars};
use crate::expr::Ref;
use crate::external::{EnvSource, ExternalSource};
use crate::path::{Key, Path};
use crate::results::{CacheHandle, NodeId, ResultStore, Results, ResultsMut};
use crate::template::{Interpolate, Templater};
use crate::value::{Map, Value};
use indexmap::IndexMap;
use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(usize);

impl ResourceId {
    #[cfg(test)]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub struct Resource {
    name: String,
    parent: Option<ResourceId>,
    children: Vec<ResourceId>,
    pub(crate) attributes: ResultStore,
}

/// Evaluation limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_new::new)]
pub struct Limits {
    /// Maximum nesting of evaluations, materialization and serialization
    pub max_depth: usize,
}

/// A full default depth of nested references fits the 2 MiB stack of a spawned thread in
/// unoptimized builds
impl Default for Limits {
    fn default() -> Self {
        Self { max_depth: 40 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, derive_new::new)]
pub struct SerializeOptions {
    /// Inline the content of external values instead of their reference document
    pub resolve_external: bool,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("a resource named `{0}` already exists")]
    DuplicateName(String),
    #[error("unknown resource #{}", .0.index())]
    UnknownResource(ResourceId),
}

pub struct ResourceTree {
    resources: Vec<Resource>,
    names: IndexMap<String, ResourceId>,
    templater: Box<dyn Templater>,
    externals: IndexMap<String, Box<dyn ExternalSource>>,
    limits: Limits,
    depth: Cell<usize>,
}

impl std::fmt::Debug for ResourceTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTree")
            .field("resources", &self.resources)
            .field("externals", &self.externals.keys().collect::<Vec<_>>())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Default for ResourceTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the evaluation depth when dropped
pub(crate) struct DepthGuard<'t>(&'t Cell<usize>);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

impl ResourceTree {
    /// Empty tree using [Interpolate] and the `env` external source
    pub fn new() -> Self {
        let mut tree = Self {
            resources: vec![],
            names: IndexMap::new(),
            templater: Box::new(Interpolate),
            externals: IndexMap::new(),
            limits: Limits::default(),
            depth: Cell::new(0),
        };
        tree.register_external("env", EnvSource);
        tree
    }

    pub fn with_templater(mut self, templater: impl Templater + 'static) -> Self {
        self.templater = Box::new(templater);
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn register_external(
        &mut self,
        kind: impl Into<String>,
        source: impl ExternalSource + 'static,
    ) {
        self.externals.insert(kind.into(), Box::new(source));
    }

    pub fn add_resource(
        &mut self,
        name: impl Into<String>,
        attributes: &Map,
        parent: Option<ResourceId>,
    ) -> Result<ResourceId, TreeError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(TreeError::DuplicateName(name));
        }
        if let Some(parent) = parent {
            if parent.0 >= self.resources.len() {
                return Err(TreeError::UnknownResource(parent));
            }
        }

        let id = ResourceId(self.resources.len());
        tracing::trace!(%name, ?parent, "add resource");
        self.resources.push(Resource {
            name: name.clone(),
            parent,
            children: vec![],
            attributes: ResultStore::new(attributes),
        });
        self.names.insert(name, id);
        if let Some(parent) = parent {
            self.resources[parent.0].children.push(id);
        }

        Ok(id)
    }

    /// Bindings used while resolving the attributes of `id`
    pub fn set_bindings(&mut self, id: ResourceId, vars: Vars) {
        self.resources[id.0].attributes.set_vars(vars);
    }

    pub fn bindings(&self, id: ResourceId) -> &Vars {
        self.resources[id.0].attributes.vars()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// All resources in insertion order
    pub fn ids(&self) -> impl Iterator<Item = ResourceId> {
        (0..self.resources.len()).map(ResourceId)
    }

    pub(crate) fn resource(&self, id: ResourceId) -> &Resource {
        &self.resources[id.0]
    }

    pub fn name(&self, id: ResourceId) -> &str {
        &self.resources[id.0].name
    }

    pub fn parent(&self, id: ResourceId) -> Option<ResourceId> {
        self.resources[id.0].parent
    }

    pub fn find(&self, name: &str) -> Option<ResourceId> {
        self.names.get(name).copied()
    }

    /// `id` and its parents, nearest first
    pub fn ancestors(&self, id: ResourceId) -> Vec<ResourceId> {
        std::iter::successors(Some(id), |id| self.parent(*id)).collect()
    }

    /// Parents of `id`, root first
    pub fn parents(&self, id: ResourceId) -> Vec<ResourceId> {
        let mut parents = self.ancestors(id);
        parents.remove(0);
        parents.reverse();
        parents
    }

    pub fn root(&self, id: ResourceId) -> ResourceId {
        std::iter::successors(Some(id), |id| self.parent(*id))
            .last()
            .unwrap_or(id)
    }

    pub fn children(&self, id: ResourceId) -> &[ResourceId] {
        &self.resources[id.0].children
    }

    /// `id` and everything below it, depth first
    pub fn descendants(&self, id: ResourceId) -> Vec<ResourceId> {
        let mut descendants = vec![];
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            descendants.push(next);
            stack.extend(self.children(next).iter().rev());
        }
        descendants
    }

    /// Children of `id` keyed by name
    pub fn named(&self, id: ResourceId) -> Map {
        self.children(id)
            .iter()
            .map(|child| (self.name(*child).to_string(), Value::Resource(*child)))
            .collect()
    }

    pub fn attributes(&self, id: ResourceId) -> Results<'_> {
        self.results(CacheHandle {
            resource: id,
            node: NodeId::ROOT,
        })
    }

    pub fn attributes_mut(&mut self, id: ResourceId) -> ResultsMut<'_> {
        self.results_mut(CacheHandle {
            resource: id,
            node: NodeId::ROOT,
        })
    }

    pub fn results(&self, handle: CacheHandle) -> Results<'_> {
        Results::new(self, handle)
    }

    pub fn results_mut(&mut self, handle: CacheHandle) -> ResultsMut<'_> {
        ResultsMut::new(&mut self.resources[handle.resource.0].attributes, handle.node)
    }

    /// Resolves a path expression or reference document against `current`
    #[tracing::instrument(level = "debug", skip_all, fields(resource = self.name(current)))]
    pub fn resolve(&self, current: ResourceId, expr: impl Into<Value>) -> Result<Vec<Value>, Error> {
        Ref::from_value(&expr.into())?.resolve(self, current.into())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(resource = self.name(current)))]
    pub fn resolve_one(&self, current: ResourceId, expr: impl Into<Value>) -> Result<Value, Error> {
        Ref::from_value(&expr.into())?.resolve_one(self, current.into())
    }

    pub fn evaluate(
        &self,
        values: &[Value],
        path: &Path,
        ctx: &EvalContext,
    ) -> Result<Vec<Value>, Error> {
        crate::eval::evaluate(self, values, path, ctx)
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub(crate) fn enter(&self) -> Result<DepthGuard<'_>, Error> {
        let depth = self.depth.get() + 1;
        if depth > self.limits.max_depth {
            return Err(Error::RecursionLimit(self.limits.max_depth));
        }
        self.depth.set(depth);
        Ok(DepthGuard(&self.depth))
    }

    pub fn external_source(&self, kind: &str) -> Option<&dyn ExternalSource> {
        self.externals.get(kind).map(|source| source.as_ref())
    }

    pub fn render(&self, template: &str, vars: &Vars) -> Result<String, Error> {
        Ok(self.templater.render(template, vars)?)
    }

    /// Plain data: lazy containers are resolved, external values replaced by their content.
    /// Resources are kept.
    pub fn materialize(&self, value: &Value) -> Result<Value, Error> {
        match value {
            Value::Lazy(handle) => self.results(*handle).materialize(),
            Value::External(external) => self.materialize(&external.value),
            Value::Array(items) => {
                let _guard = self.enter()?;
                items
                    .iter()
                    .map(|item| self.materialize(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            Value::Object(map) => {
                let _guard = self.enter()?;
                map.iter()
                    .map(|(key, value)| Ok((key.clone(), self.materialize(value)?)))
                    .collect::<Result<Map, Error>>()
                    .map(Value::Object)
            }
            other => Ok(other.clone()),
        }
    }

    /// Storage form of a value
    ///
    /// Resources become `{ref: '::<name>'}`, external values their reference document and
    /// lazy containers serialize their entries (see [Results::serialize]).
    pub fn serialize(&self, value: &Value, options: &SerializeOptions) -> Result<Value, Error> {
        match value {
            Value::Resource(id) => Ok(Value::Object(Map::from_iter([(
                "ref".to_string(),
                Value::String(format!("::{}", self.name(*id))),
            )]))),
            Value::Lazy(handle) => self.results(*handle).serialize(options),
            Value::External(external) if options.resolve_external => {
                self.serialize(&external.value, options)
            }
            Value::External(external) => Ok(external.reference.as_ref_document()),
            Value::Array(items) => {
                let _guard = self.enter()?;
                items
                    .iter()
                    .map(|item| self.serialize(item, options))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            Value::Object(map) => {
                let _guard = self.enter()?;
                map.iter()
                    .map(|(key, value)| Ok((key.clone(), self.serialize(value, options)?)))
                    .collect::<Result<Map, Error>>()
                    .map(Value::Object)
            }
            other => Ok(other.clone()),
        }
    }

    pub fn truthy(&self, value: &Value) -> bool {
        match value {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Decimal(d) => *d != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Resource(_) => true,
            Value::Lazy(handle) => !self.results(*handle).is_empty(),
            Value::External(external) => self.truthy(&external.value),
        }
    }

    /// Elements of a plain or lazy sequence, `None` for anything else
    pub fn elements(&self, value: &Value) -> Result<Option<Vec<Value>>, Error> {
        match value {
            Value::Array(items) => Ok(Some(items.clone())),
            Value::Lazy(handle) => {
                let results = self.results(*handle);
                if results.is_list() {
                    results.values().map(Some)
                } else {
                    Ok(None)
                }
            }
            Value::External(external) => self.elements(&external.value),
            _ => Ok(None),
        }
    }

    fn property(&self, id: ResourceId, name: &str) -> Option<Value> {
        let resources = |ids: Vec<ResourceId>| Value::Array(ids.into_iter().map(Value::Resource).collect());

        Some(match name {
            "." => Value::Resource(id),
            ".." => Value::Resource(self.parent(id)?),
            ".name" => Value::String(self.name(id).to_string()),
            ".parents" => resources(self.parents(id)),
            ".ancestors" => resources(self.ancestors(id)),
            ".root" => Value::Resource(self.root(id)),
            ".children" => resources(self.children(id).to_vec()),
            ".descendants" | ".descendents" => resources(self.descendants(id)),
            ".named" => Value::Object(self.named(id)),
            _ => return None,
        })
    }
}

impl ResolveByName for ResourceId {
    fn resolve_by_name(&self, key: &Key, tree: &ResourceTree) -> Result<Option<Value>, Error> {
        let Some(name) = key.as_name() else {
            return Ok(None);
        };

        if name.starts_with('.') {
            if let Some(value) = tree.property(*self, &name) {
                return Ok(Some(value));
            }
        }

        for id in tree.ancestors(*self) {
            if let Some(value) = tree.attributes(id).get(&name)? {
                return Ok(Some(value));
            }
        }

        Ok(tree.find(&name).map(Value::Resource))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource_tree;
    use pretty_assertions::assert_eq;

    const FAMILY: &str = r#"
name: root
attributes:
  color: blue
  size: 1
resources:
  - name: a
    attributes: {size: 2}
    resources:
      - name: a1
      - name: a2
  - name: b
"#;

    fn names(tree: &ResourceTree, value: &Value) -> Value {
        match value {
            Value::Resource(id) => Value::from(tree.name(*id)),
            Value::Array(items) => Value::Array(items.iter().map(|item| names(tree, item)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), names(tree, value)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn yaml(source: &str) -> Value {
        serde_yaml::from_str(source).unwrap()
    }

    #[test]
    fn navigation() {
        let tree = resource_tree!(FAMILY);
        let a1 = tree.find("a1").unwrap();
        let root = tree.find("root").unwrap();

        let property = |id: ResourceId, name: &str| {
            let value = id
                .resolve_by_name(&Key::Name(name.to_string()), &tree)
                .unwrap();
            value.map(|value| names(&tree, &value))
        };

        assert_eq!(property(a1, "."), Some(yaml("a1")));
        assert_eq!(property(a1, ".."), Some(yaml("a")));
        assert_eq!(property(root, ".."), None);
        assert_eq!(property(a1, ".name"), Some(yaml("a1")));
        assert_eq!(property(a1, ".ancestors"), Some(yaml("[a1, a, root]")));
        assert_eq!(property(a1, ".parents"), Some(yaml("[root, a]")));
        assert_eq!(property(a1, ".root"), Some(yaml("root")));
        assert_eq!(property(root, ".children"), Some(yaml("[a, b]")));
        assert_eq!(property(root, ".descendants"), Some(yaml("[root, a, a1, a2, b]")));
        assert_eq!(property(root, ".descendents"), Some(yaml("[root, a, a1, a2, b]")));
        assert_eq!(property(a1, ".children"), Some(yaml("[]")));
        assert_eq!(property(root, ".named"), Some(yaml("{a: a, b: b}")));
    }

    #[test]
    fn lookup_order() {
        let tree = resource_tree!(FAMILY);
        let a1 = tree.find("a1").unwrap();
        let b = tree.find("b").unwrap();

        assert_eq!(tree.resolve_one(a1, "size").unwrap(), Value::Integer(2));
        assert_eq!(tree.resolve_one(b, "size").unwrap(), Value::Integer(1));
        assert_eq!(tree.resolve_one(a1, "color").unwrap(), Value::from("blue"));
        assert_eq!(tree.resolve_one(b, "a2").unwrap(), Value::Resource(tree.find("a2").unwrap()));
        assert_eq!(tree.resolve_one(b, "a2::size").unwrap(), Value::Integer(2));
        assert_eq!(tree.resolve_one(b, "nothing").unwrap(), Value::Null);
    }

    #[test]
    fn structure_errors() {
        let mut tree = ResourceTree::new();
        let root = tree.add_resource("root", &Map::new(), None).unwrap();
        assert_eq!(
            tree.add_resource("root", &Map::new(), Some(root)),
            Err(TreeError::DuplicateName("root".to_string()))
        );
        assert_eq!(
            tree.add_resource("child", &Map::new(), Some(ResourceId(7))),
            Err(TreeError::UnknownResource(ResourceId(7)))
        );
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn serialize_resources() {
        let tree = resource_tree!(FAMILY);
        let a = tree.find("a").unwrap();
        let value = Value::Array(vec![Value::from("x"), Value::Resource(a)]);

        assert_eq!(
            tree.serialize(&value, &SerializeOptions::default()).unwrap(),
            yaml("[x, {ref: '::a'}]")
        );
    }

    #[test]
    fn truthiness() {
        let tree = resource_tree!(
            r#"
name: test
attributes:
  empty: []
  full: [0]
"#
        );
        let test = tree.find("test").unwrap();

        for (value, expected) in [
            (Value::Null, false),
            (Value::Integer(0), false),
            (Value::Decimal(0.5), true),
            (Value::from(""), false),
            (Value::from("x"), true),
            (Value::Array(vec![]), false),
            (Value::Resource(test), true),
            (tree.resolve_one(test, "empty").unwrap(), false),
            (tree.resolve_one(test, "full").unwrap(), true),
        ] {
            assert_eq!(tree.truthy(&value), expected, "{value:?}");
        }
    }

    /// `a0: {ref: a1}`, ..., `a<links>: done`
    fn reference_chain(links: usize) -> ResourceTree {
        let mut attributes = Map::new();
        for link in 0..links {
            attributes.insert(
                format!("a{link}"),
                Value::Object(Map::from_iter([(
                    "ref".to_string(),
                    Value::String(format!("a{}", link + 1)),
                )])),
            );
        }
        attributes.insert(format!("a{links}"), Value::from("done"));

        let spec = crate::manifest::ResourceSpec {
            name: "chain".to_string(),
            attributes,
            vars: Vars::new(),
            resources: vec![],
        };
        ResourceTree::from_spec(&spec).unwrap()
    }

    #[test]
    fn reference_chains_within_default_limits() {
        let max_depth = Limits::default().max_depth;

        let tree = reference_chain(max_depth - 2);
        let chain = tree.find("chain").unwrap();
        assert_eq!(tree.resolve_one(chain, "a0").unwrap(), Value::from("done"));

        let tree = reference_chain(max_depth + 2);
        let chain = tree.find("chain").unwrap();
        assert!(matches!(
            tree.resolve_one(chain, "a0"),
            Err(Error::RecursionLimit(depth)) if depth == max_depth
        ));
        // the failed chain is left unresolved and can be read from its tail
        assert_eq!(tree.resolve_one(chain, "a5").unwrap(), Value::from("done"));
    }

    #[test]
    fn recursion_limit() {
        let tree = crate::manifest::from_yaml_str(
            r#"
name: test
attributes:
  a: {x: {ref: a}}
"#,
        )
        .unwrap()
        .with_limits(Limits::new(16));
        let test = tree.find("test").unwrap();

        let a = tree.resolve_one(test, "a").unwrap();
        assert!(matches!(tree.materialize(&a), Err(Error::RecursionLimit(16))));
        assert_eq!(
            tree.serialize(&a, &SerializeOptions::default()).unwrap(),
            yaml("{x: {ref: a}}")
        );
    }
}
