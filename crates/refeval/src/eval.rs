//! Segment evaluation
//!
//! [evaluate] applies a [Path] to a list of current values. Every segment maps each item
//! to zero or more values:
//! - lists (plain or lazy) are broadcast: the segment is applied to each element, unless the
//!   key is an index or `*`
//! - the key is looked up through [ResolveByName], missing keys are no match
//! - filters keep the candidate when they yield something (or nothing, when negated)
//! - a test compares the candidate with a literal or a variable
//!
//! No match is an empty result, never an error.
use crate::error::Error;
use crate::path::{Comparator, Key, Modifier, Operand, Path, Segment, Test};
use crate::resource::ResourceTree;
use crate::value::{Map, Value};
use std::borrow::Cow;

/// Variable bindings of an evaluation
pub type Vars = Map;

/// State shared by all segments of one evaluation
#[derive(Debug, Clone, derive_new::new)]
pub struct EvalContext {
    /// The value paths are evaluated against, usually a resource
    pub current: Value,
    #[new(default)]
    pub vars: Vars,
    /// Above zero, every segment step is logged at debug level
    #[new(default)]
    pub trace: u8,
}

impl EvalContext {
    pub fn with_vars(mut self, vars: Vars) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_trace(mut self, trace: u8) -> Self {
        self.trace = trace;
        self
    }

    /// Same bindings, different current value
    pub(crate) fn at(&self, current: Value) -> Self {
        Self {
            current,
            vars: self.vars.clone(),
            trace: self.trace,
        }
    }
}

/// Name based lookup, implemented by everything a path can descend into
pub trait ResolveByName {
    /// `Ok(None)` when `key` is absent, `Err` only for real failures
    fn resolve_by_name(&self, key: &Key, tree: &ResourceTree) -> Result<Option<Value>, Error>;

    /// Values matched by the `*` wildcard
    fn members(&self, _tree: &ResourceTree) -> Result<Vec<Value>, Error> {
        Ok(vec![])
    }
}

impl ResolveByName for Map {
    fn resolve_by_name(&self, key: &Key, _tree: &ResourceTree) -> Result<Option<Value>, Error> {
        Ok(key.as_name().and_then(|name| self.get(name.as_ref()).cloned()))
    }

    fn members(&self, _tree: &ResourceTree) -> Result<Vec<Value>, Error> {
        Ok(self.values().cloned().collect())
    }
}

impl ResolveByName for [Value] {
    fn resolve_by_name(&self, key: &Key, _tree: &ResourceTree) -> Result<Option<Value>, Error> {
        let Key::Index(index) = key else {
            return Ok(None);
        };

        Ok(normalize_index(*index, self.len()).map(|index| self[index].clone()))
    }

    fn members(&self, _tree: &ResourceTree) -> Result<Vec<Value>, Error> {
        Ok(self.to_vec())
    }
}

impl ResolveByName for Value {
    fn resolve_by_name(&self, key: &Key, tree: &ResourceTree) -> Result<Option<Value>, Error> {
        match self {
            Value::Object(map) => map.resolve_by_name(key, tree),
            Value::Array(items) => items.resolve_by_name(key, tree),
            Value::Resource(id) => id.resolve_by_name(key, tree),
            Value::Lazy(handle) => tree.results(*handle).resolve_by_name(key, tree),
            Value::External(external) => external.resolve_by_name(key, tree),
            _ => Ok(None),
        }
    }

    fn members(&self, tree: &ResourceTree) -> Result<Vec<Value>, Error> {
        match self {
            Value::Object(map) => map.members(tree),
            Value::Array(items) => items.members(tree),
            Value::Resource(id) => id.members(tree),
            Value::Lazy(handle) => tree.results(*handle).members(tree),
            Value::External(external) => external.members(tree),
            _ => Ok(vec![]),
        }
    }
}

/// Index into a sequence of `len` elements, negative indices count from the end
pub(crate) fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { len + index } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

/// Evaluates `path` against `values`
///
/// Lists found at the end of the path are returned as single values, they are not flattened.
pub fn evaluate(
    tree: &ResourceTree,
    values: &[Value],
    path: &Path,
    ctx: &EvalContext,
) -> Result<Vec<Value>, Error> {
    let _guard = tree.enter()?;

    let mut results = vec![];
    walk(tree, values, path.segments(), ctx, &mut results)?;
    Ok(results)
}

fn walk(
    tree: &ResourceTree,
    items: &[Value],
    segments: &[Segment],
    ctx: &EvalContext,
    results: &mut Vec<Value>,
) -> Result<(), Error> {
    let Some((segment, rest)) = segments.split_first() else {
        results.extend_from_slice(items);
        return Ok(());
    };

    // an unbound or non scalar `$var` key matches nothing
    let Some(key) = bind_key(&segment.key, ctx) else {
        return Ok(());
    };

    for item in items {
        let before = results.len();

        // index and `*` keys address the sequence itself
        let broadcast = !key.is_index() && !key.is_wildcard();
        match tree.elements(item)? {
            Some(elements) if broadcast => {
                walk(tree, &elements, segments, ctx, results)?;
            }
            _ => {
                let selected = select(tree, item, &key, segment, ctx)?;
                if ctx.trace > 0 {
                    tracing::debug!(%segment, item = item.type_name(), matches = selected.len(), "segment");
                }
                walk(tree, &selected, rest, ctx, results)?;
            }
        }

        if segment.modifier == Modifier::First && results.len() > before {
            break;
        }
    }

    Ok(())
}

/// Replaces a `$var` key by the variable's value
fn bind_key<'k>(key: &'k Key, ctx: &EvalContext) -> Option<Cow<'k, Key>> {
    let Key::Var(name) = key else {
        return Some(Cow::Borrowed(key));
    };

    match ctx.vars.get(name)? {
        Value::String(name) => Some(Cow::Owned(Key::Name(name.clone()))),
        Value::Integer(index) => Some(Cow::Owned(Key::Index(*index))),
        _ => None,
    }
}

/// Applies key, filters and test of `segment` to a single (non broadcast) item
fn select(
    tree: &ResourceTree,
    item: &Value,
    key: &Key,
    segment: &Segment,
    ctx: &EvalContext,
) -> Result<Vec<Value>, Error> {
    let candidates = match key {
        Key::Empty => vec![item.clone()],
        key if key.is_wildcard() => item.members(tree)?,
        key => item.resolve_by_name(key, tree)?.into_iter().collect(),
    };

    let mut selected = Vec::with_capacity(candidates.len());
    'candidates: for candidate in candidates {
        for filter in &segment.filters {
            let negate = filter.first().modifier == Modifier::Negate;
            let matched = !evaluate(tree, std::slice::from_ref(&candidate), filter, ctx)?.is_empty();
            if matched == negate {
                continue 'candidates;
            }
        }

        if let Some(test) = &segment.test {
            if !compare(tree, &candidate, test, ctx)? {
                continue;
            }
        }

        selected.push(candidate);
    }

    Ok(selected)
}

fn compare(
    tree: &ResourceTree,
    value: &Value,
    test: &Test,
    ctx: &EvalContext,
) -> Result<bool, Error> {
    let equal = match &test.operand {
        Operand::Var(name) => match ctx.vars.get(name) {
            Some(bound) => Some(tree.materialize(value)? == tree.materialize(bound)?),
            None => None,
        },
        Operand::Literal(literal) => literal_equals(value, literal),
    };

    // a value that can not be compared is "not equal"
    Ok(match test.comparator {
        Comparator::Equals => equal == Some(true),
        Comparator::NotEquals => equal != Some(true),
    })
}

/// Compares `value` with `literal` coerced into the type of `value`
fn literal_equals(value: &Value, literal: &str) -> Option<bool> {
    match value {
        Value::String(s) => Some(s == literal),
        Value::Integer(i) => literal.trim().parse::<i64>().ok().map(|l| l == *i),
        Value::Decimal(d) => literal.trim().parse::<f64>().ok().map(|l| l == *d),
        Value::Boolean(b) => match literal.trim() {
            "true" | "True" => Some(*b),
            "false" | "False" => Some(!*b),
            _ => None,
        },
        Value::External(external) => literal_equals(&external.value, literal),
        _ => None,
    }
}
