//! Lazy result caches
//!
//! Every resource owns a [ResultStore] holding its attributes. Attributes are stored raw and
//! promoted on first read:
//! - reference documents are resolved against the owning resource
//! - mappings and sequences become nested cache nodes, read through [Results] again
//! - strings are rendered by the tree's templater
//! - other scalars are kept as they are
//!
//! A promoted slot remembers its raw form as `original`, reads after the first return the
//! memoized value. This is what [Results::has_diff] and [Results::get_diff] compare against.
//!
//! Reading only needs `&ResourceTree`. Changing values goes through [ResultsMut], which
//! requires `&mut ResourceTree`, so evaluation never mutates.
use crate::error::Error;
use crate::eval::{normalize_index, EvalContext, ResolveByName, Vars};
use crate::expr::{default_vars, Ref};
use crate::external::{ExternalRef, ExternalValue};
use crate::path::Key;
use crate::resource::{ResourceId, ResourceTree};
use crate::value::{Map, Value};
use crate::SerializeOptions;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt::{Display, Formatter};

/// Key marking a deleted entry in a diff: `{"+%": "delete"}`
pub const DIFF_DIRECTIVE: &str = "+%";

fn tombstone() -> Value {
    Value::Object(Map::from_iter([(
        DIFF_DIRECTIVE.to_string(),
        Value::from("delete"),
    )]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(usize);

impl NodeId {
    pub(crate) const ROOT: NodeId = NodeId(0);
}

/// Address of a cache node: the owning resource and the node within its store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheHandle {
    pub(crate) resource: ResourceId,
    pub(crate) node: NodeId,
}

impl CacheHandle {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }
}

/// A memoized value
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    /// Value as first stored, `None` for entries created after loading
    pub original: Option<Value>,
    pub resolved: Value,
    /// Set when the value comes from an external source
    pub external: Option<ExternalRef>,
    /// Produced from a reference document or a template, serializes as `original`
    pub computed: bool,
}

#[derive(Debug, Clone)]
enum Slot {
    Raw(Value),
    Resolving,
    Ready(CachedResult),
}

#[derive(Debug, Clone)]
enum Node {
    Map {
        entries: IndexMap<String, Slot>,
        /// originals of deleted entries
        deleted: IndexMap<String, Value>,
    },
    List {
        entries: Vec<Slot>,
        /// originals of removed elements
        removed: Vec<Value>,
    },
}

impl Node {
    fn map(map: &Map) -> Node {
        Node::Map {
            entries: map
                .iter()
                .map(|(key, value)| (key.clone(), Slot::Raw(value.clone())))
                .collect(),
            deleted: IndexMap::new(),
        }
    }

    fn list(items: &[Value]) -> Node {
        Node::List {
            entries: items.iter().cloned().map(Slot::Raw).collect(),
            removed: vec![],
        }
    }

    fn len(&self) -> usize {
        match self {
            Node::Map { entries, .. } => entries.len(),
            Node::List { entries, .. } => entries.len(),
        }
    }

    fn slot_mut(&mut self, key: SlotKey) -> Option<&mut Slot> {
        match (self, key) {
            (Node::Map { entries, .. }, SlotKey::Name(name)) => entries.get_mut(name),
            (Node::List { entries, .. }, SlotKey::Index(index)) => entries.get_mut(index),
            _ => None,
        }
    }

    fn slot_keys(&self) -> Vec<SlotKey<'static>> {
        match self {
            Node::Map { entries, .. } => entries
                .keys()
                .map(|key| SlotKey::Owned(key.clone()))
                .collect(),
            Node::List { entries, .. } => (0..entries.len()).map(SlotKey::Index).collect(),
        }
    }
}

#[derive(Debug, Clone)]
enum SlotKey<'k> {
    Name(&'k str),
    Owned(String),
    Index(usize),
}

impl SlotKey<'_> {
    fn borrowed(&self) -> SlotKey<'_> {
        match self {
            SlotKey::Name(name) => SlotKey::Name(name),
            SlotKey::Owned(name) => SlotKey::Name(name),
            SlotKey::Index(index) => SlotKey::Index(*index),
        }
    }
}

impl Display for SlotKey<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotKey::Name(name) => f.write_str(name),
            SlotKey::Owned(name) => f.write_str(name),
            SlotKey::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Attribute cache of one resource
#[derive(Debug)]
pub struct ResultStore {
    /// Bindings used when resolving references and rendering templates
    vars: Vars,
    nodes: RefCell<Vec<Node>>,
}

impl ResultStore {
    pub(crate) fn new(attributes: &Map) -> Self {
        Self {
            vars: Vars::new(),
            nodes: RefCell::new(vec![Node::map(attributes)]),
        }
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    pub(crate) fn set_vars(&mut self, vars: Vars) {
        self.vars = vars;
    }

    fn push(&self, node: Node) -> NodeId {
        let mut nodes = self.nodes.borrow_mut();
        nodes.push(node);
        NodeId(nodes.len() - 1)
    }
}

/// Read access to a cache node
#[derive(Clone, Copy, derive_new::new)]
pub struct Results<'t> {
    tree: &'t ResourceTree,
    handle: CacheHandle,
}

impl std::fmt::Debug for Results<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Results")
            .field("resource", &self.tree.name(self.handle.resource))
            .field("node", &self.handle.node)
            .finish()
    }
}

impl<'t> Results<'t> {
    pub fn handle(&self) -> CacheHandle {
        self.handle
    }

    fn store(&self) -> &'t ResultStore {
        &self.tree.resource(self.handle.resource).attributes
    }

    fn snapshot(&self) -> Node {
        self.store().nodes.borrow()[self.handle.node.0].clone()
    }

    pub fn is_list(&self) -> bool {
        matches!(
            self.store().nodes.borrow()[self.handle.node.0],
            Node::List { .. }
        )
    }

    pub fn len(&self) -> usize {
        self.store().nodes.borrow()[self.handle.node.0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of a mapping node, in order. Empty for sequences
    pub fn keys(&self) -> Vec<String> {
        match &self.store().nodes.borrow()[self.handle.node.0] {
            Node::Map { entries, .. } => entries.keys().cloned().collect(),
            Node::List { .. } => vec![],
        }
    }

    /// Value of a mapping entry, resolving it on first access
    pub fn get(&self, name: &str) -> Result<Option<Value>, Error> {
        Ok(self.fetch(SlotKey::Name(name))?.map(|result| result.resolved))
    }

    /// Element of a sequence, resolving it on first access
    pub fn get_index(&self, index: usize) -> Result<Option<Value>, Error> {
        Ok(self.fetch(SlotKey::Index(index))?.map(|result| result.resolved))
    }

    /// The memoized result of a mapping entry, resolving it on first access
    pub fn result(&self, name: &str) -> Result<Option<CachedResult>, Error> {
        self.fetch(SlotKey::Name(name))
    }

    /// All values of the node in order, resolving them
    pub fn values(&self) -> Result<Vec<Value>, Error> {
        let keys = self.snapshot().slot_keys();
        let mut values = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(result) = self.fetch(key.borrowed())? {
                values.push(result.resolved);
            }
        }
        Ok(values)
    }

    fn fetch(&self, key: SlotKey) -> Result<Option<CachedResult>, Error> {
        let store = self.store();

        let raw = {
            let mut nodes = store.nodes.borrow_mut();
            let Some(slot) = nodes[self.handle.node.0].slot_mut(key.borrowed()) else {
                return Ok(None);
            };

            match std::mem::replace(slot, Slot::Resolving) {
                Slot::Raw(raw) => raw,
                Slot::Ready(result) => {
                    *slot = Slot::Ready(result.clone());
                    return Ok(Some(result));
                }
                Slot::Resolving => {
                    let resource = self.tree.name(self.handle.resource).to_string();
                    tracing::debug!(%resource, %key, "reference cycle");
                    return Err(Error::Cycle {
                        resource,
                        key: key.to_string(),
                    });
                }
            }
        };

        let promoted = self.promote(&raw);
        tracing::trace!(%key, ok = promoted.is_ok(), "promoted");

        let mut nodes = store.nodes.borrow_mut();
        let slot = nodes[self.handle.node.0].slot_mut(key.borrowed());
        match (slot, promoted) {
            (Some(slot), Ok(result)) => {
                *slot = Slot::Ready(result.clone());
                Ok(Some(result))
            }
            (Some(slot), Err(error)) => {
                *slot = Slot::Raw(raw);
                Err(error)
            }
            (None, promoted) => promoted.map(Some),
        }
    }

    fn promote(&self, raw: &Value) -> Result<CachedResult, Error> {
        let store = self.store();
        let owner = self.handle.resource;

        if Ref::is_ref(raw) {
            let ctx = EvalContext::new(owner.into()).with_vars(store.vars.clone());
            let (resolved, external) = match Ref::from_value(raw)?.resolve_one_in(self.tree, &ctx)? {
                Value::External(external) => {
                    let ExternalValue { reference, value } = *external;
                    (value, Some(reference))
                }
                value => (value, None),
            };

            return Ok(CachedResult {
                original: Some(raw.clone()),
                resolved,
                external,
                computed: true,
            });
        }

        let (resolved, computed) = match raw {
            Value::Object(map) => (self.child(store.push(Node::map(map))), false),
            Value::Array(items) => (self.child(store.push(Node::list(items))), false),
            Value::String(template) => {
                let mut vars = default_vars();
                vars.extend(store.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
                let rendered = self.tree.render(template, &vars)?;
                let computed = rendered != *template;
                (Value::String(rendered), computed)
            }
            other => (other.clone(), false),
        };

        Ok(CachedResult {
            original: Some(raw.clone()),
            resolved,
            external: None,
            computed,
        })
    }

    fn child(&self, node: NodeId) -> Value {
        Value::Lazy(CacheHandle {
            resource: self.handle.resource,
            node,
        })
    }

    /// Resolves every entry, descending into nested mappings and sequences
    pub fn resolve_all(&self) -> Result<(), Error> {
        for key in self.snapshot().slot_keys() {
            let Some(result) = self.fetch(key.borrowed())? else {
                continue;
            };
            if let (Value::Lazy(handle), false) = (&result.resolved, result.computed) {
                self.tree.results(*handle).resolve_all()?;
            }
        }
        Ok(())
    }

    /// Plain data, resolving everything
    pub fn materialize(&self) -> Result<Value, Error> {
        let _guard = self.tree.enter()?;

        match self.snapshot() {
            Node::Map { entries, .. } => {
                let mut map = Map::with_capacity(entries.len());
                for key in entries.keys() {
                    if let Some(value) = self.get(key)? {
                        map.insert(key.clone(), self.tree.materialize(&value)?);
                    }
                }
                Ok(Value::Object(map))
            }
            Node::List { entries, .. } => {
                let mut items = Vec::with_capacity(entries.len());
                for index in 0..entries.len() {
                    if let Some(value) = self.get_index(index)? {
                        items.push(self.tree.materialize(&value)?);
                    }
                }
                Ok(Value::Array(items))
            }
        }
    }

    /// Storage form: unread entries stay raw, references and templates serialize as written,
    /// external values as reference documents
    pub fn serialize(&self, options: &SerializeOptions) -> Result<Value, Error> {
        let _guard = self.tree.enter()?;

        match self.snapshot() {
            Node::Map { entries, .. } => {
                let mut map = Map::with_capacity(entries.len());
                for (key, slot) in entries {
                    let value = self.serialize_slot(&SlotKey::Name(&key), slot, options)?;
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            Node::List { entries, .. } => entries
                .into_iter()
                .enumerate()
                .map(|(index, slot)| self.serialize_slot(&SlotKey::Index(index), slot, options))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }

    fn serialize_slot(
        &self,
        key: &SlotKey,
        slot: Slot,
        options: &SerializeOptions,
    ) -> Result<Value, Error> {
        match slot {
            Slot::Raw(raw) => Ok(raw),
            Slot::Ready(result) => self.serialize_result(&result, options),
            Slot::Resolving => Err(Error::Cycle {
                resource: self.tree.name(self.handle.resource).to_string(),
                key: key.to_string(),
            }),
        }
    }

    fn serialize_result(
        &self,
        result: &CachedResult,
        options: &SerializeOptions,
    ) -> Result<Value, Error> {
        match (&result.external, &result.original) {
            (Some(external), _) if !options.resolve_external => Ok(external.as_ref_document()),
            (Some(_), _) => self.tree.serialize(&result.resolved, options),
            (None, Some(original)) if result.computed => Ok(original.clone()),
            _ => self.tree.serialize(&result.resolved, options),
        }
    }

    /// A nested node this result owns, not one reached through a reference
    fn owned_child(result: &CachedResult) -> Option<CacheHandle> {
        match (&result.resolved, result.computed, &result.external) {
            (Value::Lazy(handle), false, None) => Some(*handle),
            _ => None,
        }
    }

    fn result_has_diff(&self, result: &CachedResult) -> Result<bool, Error> {
        let Some(original) = &result.original else {
            return Ok(true);
        };

        if let Some(handle) = Self::owned_child(result) {
            return self.tree.results(handle).has_diff();
        }

        Ok(self.serialize_result(result, &SerializeOptions::default())? != *original)
    }

    /// Whether anything changed since loading
    ///
    /// New entries, changed values and deletions count. Entries never read are unchanged.
    pub fn has_diff(&self) -> Result<bool, Error> {
        let (slots, removed) = match self.snapshot() {
            Node::Map { entries, deleted } => (entries.into_values().collect(), !deleted.is_empty()),
            Node::List { entries, removed } => (entries, !removed.is_empty()),
        };

        if removed {
            return Ok(true);
        }

        for slot in slots {
            if let Slot::Ready(result) = slot {
                if self.result_has_diff(&result)? {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Changes since loading
    ///
    /// For a mapping: changed entries only, nested mappings recurse, deleted entries are
    /// `{"+%": "delete"}`. A sequence is returned whole.
    pub fn get_diff(&self) -> Result<Value, Error> {
        let (entries, deleted) = match self.snapshot() {
            Node::Map { entries, deleted } => (entries, deleted),
            Node::List { .. } => return self.serialize(&SerializeOptions::default()),
        };

        let mut diff = Map::new();
        for (key, slot) in entries.iter() {
            let Slot::Ready(result) = slot else {
                continue;
            };
            if let Some(changed) = self.result_diff(result)? {
                diff.insert(key.clone(), changed);
            }
        }

        for key in deleted.keys() {
            if !entries.contains_key(key) {
                diff.insert(key.clone(), tombstone());
            }
        }

        Ok(Value::Object(diff))
    }

    fn result_diff(&self, result: &CachedResult) -> Result<Option<Value>, Error> {
        if !self.result_has_diff(result)? {
            return Ok(None);
        }

        if result.original.is_some() {
            if let Some(handle) = Self::owned_child(result) {
                return self.tree.results(handle).get_diff().map(Some);
            }
        }

        let current = self.serialize_result(result, &SerializeOptions::default())?;
        Ok(Some(match (current, &result.original) {
            (Value::Object(new), Some(Value::Object(old))) => Value::Object(diff_maps(old, &new)),
            (current, _) => current,
        }))
    }

    /// Resolves both sides and compares plain data
    pub fn matches(&self, other: &Value) -> Result<bool, Error> {
        Ok(self.materialize()? == self.tree.materialize(other)?)
    }
}

/// Key level difference of two plain mappings
fn diff_maps(old: &Map, new: &Map) -> Map {
    let mut diff = Map::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            diff.insert(key.clone(), value.clone());
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            diff.insert(key.clone(), tombstone());
        }
    }
    diff
}

impl PartialEq<Value> for Results<'_> {
    fn eq(&self, other: &Value) -> bool {
        self.matches(other).unwrap_or(false)
    }
}

impl PartialEq for Results<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self.materialize(), other.materialize()) {
            (Ok(left), Ok(right)) => left == right,
            _ => false,
        }
    }
}

impl ResolveByName for Results<'_> {
    fn resolve_by_name(&self, key: &Key, _tree: &ResourceTree) -> Result<Option<Value>, Error> {
        if self.is_list() {
            return match key {
                Key::Index(index) => match normalize_index(*index, self.len()) {
                    Some(index) => self.get_index(index),
                    None => Ok(None),
                },
                _ => Ok(None),
            };
        }

        match key.as_name() {
            Some(name) => self.get(&name),
            None => Ok(None),
        }
    }

    fn members(&self, _tree: &ResourceTree) -> Result<Vec<Value>, Error> {
        self.values()
    }
}

/// Write access to a cache node
pub struct ResultsMut<'a> {
    store: &'a mut ResultStore,
    node: NodeId,
}

/// Splits an external value into its content and origin
fn split_external(value: Value) -> (Value, Option<ExternalRef>) {
    match value {
        Value::External(external) => {
            let ExternalValue { reference, value } = *external;
            (value, Some(reference))
        }
        value => (value, None),
    }
}

fn original_of(slot: Slot) -> Option<Value> {
    match slot {
        Slot::Raw(raw) => Some(raw),
        Slot::Ready(result) => result.original,
        Slot::Resolving => None,
    }
}

fn ready(original: Option<Value>, value: Value) -> Slot {
    let (resolved, external) = split_external(value);
    Slot::Ready(CachedResult {
        original,
        resolved,
        external,
        computed: false,
    })
}

impl<'a> ResultsMut<'a> {
    pub(crate) fn new(store: &'a mut ResultStore, node: NodeId) -> Self {
        Self { store, node }
    }

    fn node(&mut self) -> &mut Node {
        &mut self.store.nodes.get_mut()[self.node.0]
    }

    fn map(&mut self) -> Result<(&mut IndexMap<String, Slot>, &mut IndexMap<String, Value>), Error> {
        match self.node() {
            Node::Map { entries, deleted } => Ok((entries, deleted)),
            Node::List { .. } => Err(Error::InvalidMutation("not a mapping")),
        }
    }

    fn list(&mut self) -> Result<(&mut Vec<Slot>, &mut Vec<Value>), Error> {
        match self.node() {
            Node::List { entries, removed } => Ok((entries, removed)),
            Node::Map { .. } => Err(Error::InvalidMutation("not a sequence")),
        }
    }

    /// Stores `value` under `name`
    ///
    /// The entry keeps its original, so writing back an unchanged value is not a difference.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), Error> {
        let (entries, deleted) = self.map()?;
        let original = match entries.get(name) {
            Some(slot) => original_of(slot.clone()),
            None => deleted.shift_remove(name),
        };

        entries.insert(name.to_string(), ready(original, value));
        Ok(())
    }

    /// Removes `name`, remembering its original. Returns whether it existed
    pub fn delete(&mut self, name: &str) -> Result<bool, Error> {
        let (entries, deleted) = self.map()?;
        let Some(slot) = entries.shift_remove(name) else {
            return Ok(false);
        };

        if let Some(original) = original_of(slot) {
            deleted.insert(name.to_string(), original);
        }
        Ok(true)
    }

    pub fn push(&mut self, value: Value) -> Result<(), Error> {
        let (entries, _) = self.list()?;
        entries.push(ready(None, value));
        Ok(())
    }

    pub fn insert(&mut self, index: usize, value: Value) -> Result<(), Error> {
        let (entries, _) = self.list()?;
        if index > entries.len() {
            return Err(Error::InvalidMutation("index out of range"));
        }
        entries.insert(index, ready(None, value));
        Ok(())
    }

    pub fn set_index(&mut self, index: usize, value: Value) -> Result<(), Error> {
        let (entries, _) = self.list()?;
        let slot = entries
            .get_mut(index)
            .ok_or(Error::InvalidMutation("index out of range"))?;
        let original = original_of(slot.clone());
        *slot = ready(original, value);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<(), Error> {
        let (entries, removed) = self.list()?;
        if index >= entries.len() {
            return Err(Error::InvalidMutation("index out of range"));
        }
        if let Some(original) = original_of(entries.remove(index)) {
            removed.push(original);
        }
        Ok(())
    }
}
