//! Expressions and reference documents
//!
//! A reference document is a mapping with a `ref` (or `eval`) key and optionally `vars` and
//! `foreach`:
//!
//! ```yaml
//! ref: x::a[c=$wanted]
//! vars:
//!   wanted: 4
//! ```
//!
//! The `ref` value is either a path expression or an expression document using one of the
//! special forms:
//!
//! | form                                   | result                                        |
//! |----------------------------------------|-----------------------------------------------|
//! | `{if: cond, then: a, else: b}`         | `a` when `cond` is truthy, otherwise `b`      |
//! | `{and: [a, b, ...]}`                   | first falsy operand, otherwise the last one   |
//! | `{or: [a, b, ...]}`                    | first truthy operand, otherwise the last one  |
//! | `{not: a}`                             | boolean negation                              |
//! | `{q: a}`                               | `a`, unevaluated                              |
//! | `{lookup: {<kind>: <key>, get?: ..}}`  | value of an [external source](crate::external)|
//!
//! Inside `ref`, the lookup may also be written without the `lookup` wrapper.
use crate::error::Error;
use crate::eval::{evaluate, EvalContext, Vars};
use crate::external::ExternalRef;
use crate::path::{Key, Path};
use crate::resource::ResourceTree;
use crate::value::{Map, Value};
use std::fmt::{Display, Formatter};

/// Keys that turn a single-key mapping into a special form
pub(crate) const FORMS: [&str; 6] = ["if", "and", "or", "not", "q", "lookup"];

/// Compiled expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Path(Path),
    Reference(Box<Ref>),
    External(ExternalRef),
    If {
        condition: Box<Expr>,
        then: Option<Box<Expr>>,
        otherwise: Option<Box<Expr>>,
    },
    And(Operands),
    Or(Operands),
    Not(Box<Expr>),
    Quote(Value),
    Literal(Value),
}

/// Operands of `and` / `or`
#[derive(Debug, Clone, PartialEq)]
pub enum Operands {
    /// Written as a list, each element is an expression
    Listed(Vec<Expr>),
    /// A single expression producing the list of values
    Computed(Box<Expr>),
}

impl Expr {
    pub fn compile(value: &Value) -> Result<Expr, Error> {
        match value {
            Value::String(source) => Ok(Expr::Path(Path::parse(source)?.anchored())),
            Value::Object(_) if Ref::is_ref(value) => {
                Ok(Expr::Reference(Box::new(Ref::from_value(value)?)))
            }
            Value::Object(map) => match form_of(map) {
                Some(form) => compile_form(form, map),
                None => Ok(Expr::Literal(value.clone())),
            },
            _ => Ok(Expr::Literal(value.clone())),
        }
    }

    pub fn eval(&self, tree: &ResourceTree, ctx: &EvalContext) -> Result<Value, Error> {
        match self {
            Expr::Path(path) => Ok(one(resolve_path(tree, path, ctx)?)),
            Expr::Reference(reference) => reference.resolve_one_in(tree, ctx),
            Expr::External(reference) => Ok(Value::External(Box::new(reference.fetch(tree)?))),
            Expr::If {
                condition,
                then,
                otherwise,
            } => {
                let branch = if tree.truthy(&condition.eval(tree, ctx)?) {
                    then
                } else {
                    otherwise
                };
                match branch {
                    Some(expr) => expr.eval(tree, ctx),
                    None => Ok(Value::Null),
                }
            }
            Expr::And(operands) => operands.short_circuit(tree, ctx, false),
            Expr::Or(operands) => operands.short_circuit(tree, ctx, true),
            Expr::Not(expr) => Ok(Value::Boolean(!tree.truthy(&expr.eval(tree, ctx)?))),
            Expr::Quote(value) | Expr::Literal(value) => Ok(value.clone()),
        }
    }
}

impl Operands {
    fn compile(value: &Value) -> Result<Operands, Error> {
        match value {
            Value::Array(items) => Ok(Operands::Listed(
                items.iter().map(Expr::compile).collect::<Result<_, _>>()?,
            )),
            value => Ok(Operands::Computed(Box::new(Expr::compile(value)?))),
        }
    }

    /// Evaluates operands until one has truthiness `stop`, returns the last value evaluated
    fn short_circuit(
        &self,
        tree: &ResourceTree,
        ctx: &EvalContext,
        stop: bool,
    ) -> Result<Value, Error> {
        let mut last = Value::Null;

        match self {
            Operands::Listed(exprs) => {
                for expr in exprs {
                    last = expr.eval(tree, ctx)?;
                    if tree.truthy(&last) == stop {
                        break;
                    }
                }
            }
            Operands::Computed(expr) => {
                let value = expr.eval(tree, ctx)?;
                let items = match tree.elements(&value)? {
                    Some(items) => items,
                    None => vec![value],
                };
                for item in items {
                    last = item;
                    if tree.truthy(&last) == stop {
                        break;
                    }
                }
            }
        }

        Ok(last)
    }
}

fn form_of(map: &Map) -> Option<&'static str> {
    let mut forms = FORMS.iter().filter(|form| map.contains_key(**form));
    match (forms.next(), forms.next()) {
        (Some(form), None) => Some(*form),
        _ => None,
    }
}

fn compile_form(form: &'static str, map: &Map) -> Result<Expr, Error> {
    let argument = map.get(form).unwrap_or(&Value::Null);
    let keyword = |name: &str| -> Result<Option<Box<Expr>>, Error> {
        map.get(name)
            .map(|value| Expr::compile(value).map(Box::new))
            .transpose()
    };

    Ok(match form {
        "if" => Expr::If {
            condition: Box::new(Expr::compile(argument)?),
            then: keyword("then")?,
            otherwise: keyword("else")?,
        },
        "and" => Expr::And(Operands::compile(argument)?),
        "or" => Expr::Or(Operands::compile(argument)?),
        "not" => Expr::Not(Box::new(Expr::compile(argument)?)),
        "q" => Expr::Quote(argument.clone()),
        _ => {
            let reference = argument
                .as_object()
                .and_then(ExternalRef::from_document)
                .ok_or(Error::InvalidForm {
                    form,
                    message: "expected a mapping of the form `{<kind>: <key>, get: <getter>}`",
                })?;
            Expr::External(reference)
        }
    })
}

/// Zero matches is null, a single match is itself, several matches become a list
pub(crate) fn one(mut values: Vec<Value>) -> Value {
    match values.len() {
        0 => Value::Null,
        1 => values.pop().unwrap_or_default(),
        _ => Value::Array(values),
    }
}

/// Evaluates a path against the current value, or against a variable when it starts with `$name`
fn resolve_path(tree: &ResourceTree, path: &Path, ctx: &EvalContext) -> Result<Vec<Value>, Error> {
    let first = path.first();
    let Key::Var(name) = &first.key else {
        return evaluate(tree, std::slice::from_ref(&ctx.current), path, ctx);
    };

    let start = ctx
        .vars
        .get(name)
        .cloned()
        .ok_or_else(|| Error::UndefinedVariable(name.clone()))?;

    if path.len() == 1 && first.filters.is_empty() && first.test.is_none() {
        return Ok(vec![start]);
    }

    evaluate(tree, &[start], &path.rebased(), ctx)
}

#[derive(Debug, Clone, PartialEq)]
enum Source {
    Path(Path),
    Expr(Expr),
}

/// Evaluates a document for every match of a reference
#[derive(Debug, Clone, PartialEq)]
pub struct Foreach {
    /// Expression producing the mapping key for a match, results are collected into a
    /// mapping when present
    pub key: Option<Value>,
    /// Document evaluated against every match, the match itself when absent
    pub value: Option<Value>,
}

/// A reference: a path or expression with variable bindings
#[derive(Debug, Clone, PartialEq)]
pub struct Ref {
    vars: Vars,
    source: Source,
    foreach: Option<Foreach>,
}

/// Bindings every reference and template starts with
pub(crate) fn default_vars() -> Vars {
    Vars::from_iter([
        ("true".to_string(), Value::Boolean(true)),
        ("false".to_string(), Value::Boolean(false)),
        ("null".to_string(), Value::Null),
    ])
}

impl Ref {
    /// Reference to a path expression
    pub fn new(source: &str, vars: Vars) -> Result<Ref, Error> {
        Ok(Ref {
            vars: default_vars(),
            source: Source::Path(Path::parse(source)?.anchored()),
            foreach: None,
        }
        .with_vars(vars))
    }

    /// Whether `value` is a reference document
    ///
    /// A mapping with exactly one of `ref` / `eval` and no keys other than `vars` and
    /// `foreach` (both mappings).
    pub fn is_ref(value: &Value) -> bool {
        let Value::Object(map) = value else {
            return false;
        };

        let sources = map.keys().filter(|k| *k == "ref" || *k == "eval").count();
        sources == 1
            && map.iter().all(|(key, value)| match key.as_str() {
                "ref" | "eval" => true,
                "vars" => matches!(value, Value::Object(_) | Value::Null),
                "foreach" => matches!(value, Value::Object(_)),
                _ => false,
            })
    }

    /// Reference from a path string or a reference document
    pub fn from_value(value: &Value) -> Result<Ref, Error> {
        let map = match value {
            Value::String(source) => return Ref::new(source, Vars::new()),
            Value::Object(map) if Ref::is_ref(value) => map,
            _ => return Err(Error::NotAReference(value.type_name().to_string())),
        };

        let source = match map.get("ref").or_else(|| map.get("eval")) {
            Some(Value::String(path)) => Source::Path(Path::parse(path)?.anchored()),
            Some(Value::Object(document)) => match ExternalRef::from_document(document) {
                Some(external) => Source::Expr(Expr::External(external)),
                None => Source::Expr(Expr::compile(&Value::Object(document.clone()))?),
            },
            other => Source::Expr(Expr::Literal(other.cloned().unwrap_or_default())),
        };

        let foreach = match map.get("foreach") {
            Some(Value::Object(foreach)) => Some(Foreach {
                key: foreach.get("key").cloned(),
                value: foreach.get("value").cloned(),
            }),
            _ => None,
        };

        let mut vars = default_vars();
        if let Some(Value::Object(own)) = map.get("vars") {
            vars.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        Ok(Ref {
            vars,
            source,
            foreach,
        })
    }

    /// Adds bindings, replacing bindings of the same name
    pub fn with_vars(mut self, vars: Vars) -> Self {
        self.vars.extend(vars);
        self
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    /// All matches, an empty list when nothing matched
    pub fn resolve(&self, tree: &ResourceTree, current: Value) -> Result<Vec<Value>, Error> {
        self.resolve_in(tree, &EvalContext::new(current))
    }

    /// Null when nothing matched, the match when there is one, otherwise a list of matches
    pub fn resolve_one(&self, tree: &ResourceTree, current: Value) -> Result<Value, Error> {
        Ok(one(self.resolve(tree, current)?))
    }

    pub fn resolve_one_in(&self, tree: &ResourceTree, ctx: &EvalContext) -> Result<Value, Error> {
        Ok(one(self.resolve_in(tree, ctx)?))
    }

    /// Resolves against `ctx`, the reference's own bindings are added to the context's
    #[tracing::instrument(level = "trace", skip_all, fields(reference = %self))]
    pub fn resolve_in(&self, tree: &ResourceTree, ctx: &EvalContext) -> Result<Vec<Value>, Error> {
        let mut scope = ctx.clone();
        for (name, value) in &self.vars {
            let resolved = map_value(tree, value, &scope)?;
            scope.vars.insert(name.clone(), resolved);
        }

        let matches = match &self.source {
            Source::Path(path) => resolve_path(tree, path, &scope)?,
            Source::Expr(expr) => vec![expr.eval(tree, &scope)?],
        };

        match &self.foreach {
            Some(foreach) => foreach.apply(tree, matches, &scope),
            None => Ok(matches),
        }
    }
}

impl Foreach {
    fn apply(
        &self,
        tree: &ResourceTree,
        matches: Vec<Value>,
        scope: &EvalContext,
    ) -> Result<Vec<Value>, Error> {
        let key = self.key.as_ref().map(Expr::compile).transpose()?;

        let mut values = Vec::with_capacity(matches.len());
        let mut keyed = Map::new();
        for item in matches {
            let item_scope = scope.at(item.clone());
            let value = match &self.value {
                Some(document) => map_value(tree, document, &item_scope)?,
                None => item,
            };

            let Some(key) = &key else {
                values.push(value);
                continue;
            };

            match tree.materialize(&key.eval(tree, &item_scope)?)?.scalar_text() {
                Some(name) => {
                    keyed.insert(name, value);
                }
                None => tracing::debug!("foreach: skipping match without a scalar key"),
            }
        }

        if key.is_some() {
            values.push(Value::Object(keyed));
        }

        Ok(values)
    }
}

impl Display for Ref {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Source::Path(path) => write!(f, "{path}"),
            Source::Expr(Expr::External(external)) => write!(f, "{}:{}", external.kind, external.key),
            Source::Expr(_) => f.write_str("<expression>"),
        }
    }
}

/// Resolves reference documents nested in `value` and renders its strings
pub fn map_value(tree: &ResourceTree, value: &Value, ctx: &EvalContext) -> Result<Value, Error> {
    if Ref::is_ref(value) {
        return Ref::from_value(value)?.resolve_one_in(tree, ctx);
    }

    match value {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| Ok((key.clone(), map_value(tree, value, ctx)?)))
            .collect::<Result<Map, Error>>()
            .map(Value::Object),
        Value::Array(items) => items
            .iter()
            .map(|item| map_value(tree, item, ctx))
            .collect::<Result<Vec<_>, Error>>()
            .map(Value::Array),
        Value::String(template) => Ok(Value::String(tree.render(template, &ctx.vars)?)),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource_tree;
    use crate::SerializeOptions;
    use pretty_assertions::assert_eq;

    fn yaml(source: &str) -> Value {
        serde_yaml::from_str(source).unwrap()
    }

    fn fixture() -> ResourceTree {
        resource_tree!(
            r#"
name: test
attributes:
  name: test
  b: [1, 2, 3]
  d: {a: va, b: vb}
"#
        )
    }

    fn resolve_one(tree: &ResourceTree, current: &str, expr: &str) -> Value {
        let current = tree.find(current).unwrap();
        let value = Ref::from_value(&yaml(expr))
            .unwrap()
            .resolve_one(tree, current.into())
            .unwrap();
        tree.materialize(&value).unwrap()
    }

    #[test]
    fn reference_documents() {
        assert!(Ref::is_ref(&yaml("{ref: '::name'}")));
        assert!(Ref::is_ref(&yaml("{eval: '::name'}")));
        assert!(Ref::is_ref(&yaml("{ref: '::name', vars: {a: null}}")));
        assert!(Ref::is_ref(&yaml("{ref: '.', foreach: {value: 1}}")));
        assert!(!Ref::is_ref(&yaml("{ref: '::name', somethingUnexpected: 1}")));
        assert!(!Ref::is_ref(&yaml("{ref: a, eval: b}")));
        assert!(!Ref::is_ref(&yaml("{ref: a, vars: [1]}")));
        assert!(!Ref::is_ref(&yaml("'::name'")));
    }

    #[test]
    fn compile_classifies_once() {
        assert!(matches!(Expr::compile(&yaml("a::b")).unwrap(), Expr::Path(_)));
        assert!(matches!(
            Expr::compile(&yaml("{ref: a}")).unwrap(),
            Expr::Reference(_)
        ));
        assert!(matches!(
            Expr::compile(&yaml("{if: a, then: b}")).unwrap(),
            Expr::If { otherwise: None, .. }
        ));
        assert_eq!(
            Expr::compile(&yaml("{if: a, or: b}")).unwrap(),
            Expr::Literal(yaml("{if: a, or: b}"))
        );
        assert_eq!(
            Expr::compile(&yaml("{q: '{{ x }}'}")).unwrap(),
            Expr::Quote("{{ x }}".into())
        );
        assert_eq!(Expr::compile(&yaml("3")).unwrap(), Expr::Literal(Value::Integer(3)));
        assert!(matches!(
            Expr::compile(&yaml("{lookup: [env]}")),
            Err(Error::InvalidForm { form: "lookup", .. })
        ));
    }

    #[test]
    fn forms() {
        let tree = fixture();

        for (expr, expected) in [
            ("{ref: .name, vars: {a: null}}", "test"),
            ("{ref: $b, vars: {b: 1}}", "1"),
            (
                "{ref: {if: {not: $a}, then: {q: expected}, else: {q: unexpected}}, vars: {a: null}}",
                "expected",
            ),
            ("{ref: {or: [$a, b]}, vars: {a: null}}", "[1, 2, 3]"),
            ("{ref: {and: [$a, b]}, vars: {a: null}}", "null"),
            ("{ref: {and: [name, b]}}", "[1, 2, 3]"),
            ("{ref: {or: []}}", "null"),
            ("{ref: {or: b}}", "1"),
            ("{ref: {if: missing, then: {q: x}}}", "null"),
            ("{ref: {not: name}}", "false"),
            ("{ref: {q: {ref: name}}}", "{ref: name}"),
        ] {
            assert_eq!(resolve_one(&tree, "test", expr), yaml(expected), "expression: {expr}");
        }
    }

    #[test]
    fn resolve_wraps_expressions() {
        let tree = fixture();
        let test = tree.find("test").unwrap();
        let reference = Ref::from_value(&yaml(
            "{ref: {if: {not: $a}, then: {q: expected}}, vars: {a: null}}",
        ))
        .unwrap();

        assert_eq!(
            reference.resolve(&tree, test.into()).unwrap(),
            vec![Value::from("expected")]
        );
    }

    #[test]
    fn undefined_leading_variable() {
        let tree = fixture();
        let test = tree.find("test").unwrap();
        let error = Ref::new("$nope::a", Vars::new())
            .unwrap()
            .resolve(&tree, test.into())
            .unwrap_err();
        assert!(matches!(error, Error::UndefinedVariable(name) if name == "nope"));
    }

    #[test]
    fn caller_bindings_override_document() {
        let tree = fixture();
        let test = tree.find("test").unwrap();
        let reference = Ref::from_value(&yaml("{ref: 'd::$k', vars: {k: a}}"))
            .unwrap()
            .with_vars(Vars::from_iter([("k".to_string(), Value::from("b"))]));

        assert_eq!(
            reference.resolve_one(&tree, test.into()).unwrap(),
            Value::from("vb")
        );
    }

    #[test]
    fn variables_are_dereferenced() {
        let tree = fixture();
        let test = tree.find("test").unwrap();
        let reference = Ref::from_value(&yaml(
            r#"
eval: $aDict
vars:
  aDict:
    aRef: {eval: '::test'}
    aTemplate: '{{ true }}'
"#,
        ))
        .unwrap();

        let mut expected = Map::new();
        expected.insert("aRef".to_string(), test.into());
        expected.insert("aTemplate".to_string(), "true".into());

        assert_eq!(
            reference.resolve_one(&tree, test.into()).unwrap(),
            Value::Object(expected)
        );
    }

    #[test]
    fn foreach() {
        let tree = resource_tree!(
            r#"
name: root
resources:
  - name: web
    attributes: {port: 80}
  - name: db
    attributes: {port: 5432}
"#
        );

        assert_eq!(
            resolve_one(
                &tree,
                "root",
                "{ref: '.children::.', foreach: {value: {port: {ref: port}}}}"
            ),
            yaml("[{port: 80}, {port: 5432}]")
        );
        assert_eq!(
            resolve_one(
                &tree,
                "root",
                "{ref: '.children::.', foreach: {key: .name, value: {ref: port}}}"
            ),
            yaml("{web: 80, db: 5432}")
        );
        assert_eq!(
            resolve_one(&tree, "root", "{ref: '.children::.', foreach: {key: .name}}"),
            Value::Object(Map::from_iter([
                ("web".to_string(), tree.find("web").unwrap().into()),
                ("db".to_string(), tree.find("db").unwrap().into()),
            ]))
        );
    }

    #[test]
    fn map_value_resolves_nested_references() {
        let tree = fixture();
        let test = tree.find("test").unwrap();
        let ctx = EvalContext::new(test.into())
            .with_vars(Vars::from_iter([("aVar".to_string(), "hello".into())]));

        let value = map_value(
            &tree,
            &yaml("{a: '{{ aVar }} world', b: [{ref: d::a}], c: 3}"),
            &ctx,
        )
        .unwrap();
        assert_eq!(value, yaml("{a: hello world, b: [va], c: 3}"));
    }

    #[test]
    fn serialize_round_trip() {
        let tree = fixture();
        let test = tree.find("test").unwrap();

        let mut inner = Map::new();
        inner.insert(
            "a".to_string(),
            Value::Array(vec!["b".into(), test.into()]),
        );
        let source = Value::Object(inner);

        let serialized = tree.serialize(&source, &SerializeOptions::default()).unwrap();
        assert_eq!(serialized, yaml("{a: [b, {ref: '::test'}]}"));

        let ctx = EvalContext::new(test.into());
        assert_eq!(map_value(&tree, &serialized, &ctx).unwrap(), source);
    }

    #[test]
    fn node_traversal() {
        let tree = resource_tree!(
            r#"
name: r2
attributes:
  a: [{ref: '::r1::a'}, {ref: b}]
  b: r2
resources:
  - name: r1
    attributes:
      a: {ref: b}
      b: r1
"#
        );

        let resolve = |current: &str, expr: &str| {
            let current = tree.find(current).unwrap();
            let results = Ref::new(expr, Vars::new())
                .unwrap()
                .resolve(&tree, current.into())
                .unwrap();
            tree.materialize(&Value::Array(results)).unwrap()
        };

        assert_eq!(resolve("r1", "b"), yaml("[r1]"));
        assert_eq!(resolve("r1", "a"), yaml("[r1]"));
        assert_eq!(resolve("r2", "a"), yaml("[[r1, r2]]"));
    }

    #[test]
    fn inherited_attributes_and_ancestors() {
        let tree = resource_tree!(
            r#"
name: root
attributes:
  a: [{ref: '::child'}, {b: 2}]
resources:
  - name: child
    attributes: {b: 1}
"#
        );
        let root = tree.find("root").unwrap();
        let child = tree.find("child").unwrap();

        let resolve = |expr: &str| {
            let results = Ref::new(expr, Vars::new())
                .unwrap()
                .resolve(&tree, child.into())
                .unwrap();
            tree.materialize(&Value::Array(results)).unwrap()
        };

        assert_eq!(
            resolve(".ancestors"),
            Value::Array(vec![Value::Array(vec![child.into(), root.into()])])
        );

        let mut b = Map::new();
        b.insert("b".to_string(), Value::Integer(2));
        assert_eq!(
            resolve("a"),
            Value::Array(vec![Value::Array(vec![child.into(), Value::Object(b)])])
        );

        assert_eq!(resolve("a::b"), yaml("[1, 2]"));
    }

    #[test]
    fn external_lookup() {
        let mut tree = fixture();
        tree.register_external("vault", |key: &str| -> anyhow::Result<Value> {
            Ok(yaml(&format!("{{user: admin, password: {key}-secret}}")))
        });
        let test = tree.find("test").unwrap();

        let value = resolve_one(&tree, "test", "{ref: {vault: db, get: password}}");
        assert_eq!(value, Value::from("db-secret"));

        let value = Ref::from_value(&yaml("{ref: {lookup: {vault: db, get: user}}}"))
            .unwrap()
            .resolve_one(&tree, test.into())
            .unwrap();
        assert!(matches!(&value, Value::External(external) if external.value == Value::from("admin")));
        assert_eq!(
            tree.serialize(&value, &SerializeOptions::default()).unwrap(),
            yaml("{ref: {vault: db, get: user}}")
        );

        let error = Ref::from_value(&yaml("{ref: {nowhere: x}}"))
            .unwrap()
            .resolve_one(&tree, test.into())
            .unwrap_err();
        assert!(matches!(error, Error::UnknownExternal(kind) if kind == "nowhere"));
    }
}
