//! External values
//!
//! Values whose authoritative storage lives outside the resource tree, e.g. secrets or the
//! process environment. They are referenced with `{ref: {<kind>: <key>, get: <getter>}}` and
//! serialize back to that document instead of their content, unless
//! [SerializeOptions::resolve_external](crate::SerializeOptions::resolve_external) is set.
use crate::error::Error;
use crate::eval::ResolveByName;
use crate::expr::FORMS;
use crate::path::Key;
use crate::resource::ResourceTree;
use crate::value::{Map, Value};
use anyhow::Context;

/// A store external values are fetched from
pub trait ExternalSource {
    fn get(&self, key: &str) -> anyhow::Result<Value>;
}

impl<F> ExternalSource for F
where
    F: Fn(&str) -> anyhow::Result<Value>,
{
    fn get(&self, key: &str) -> anyhow::Result<Value> {
        self(key)
    }
}

/// Process environment, registered as `env`
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSource;

impl ExternalSource for EnvSource {
    fn get(&self, key: &str) -> anyhow::Result<Value> {
        let value = std::env::var(key).with_context(|| format!("environment variable {key}"))?;
        Ok(Value::String(value))
    }
}

/// Where an external value comes from
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new)]
pub struct ExternalRef {
    pub kind: String,
    pub key: String,
    /// Name looked up in the fetched value
    pub getter: Option<String>,
}

impl ExternalRef {
    /// `{ref: {<kind>: <key>, get: <getter>}}`
    pub fn as_ref_document(&self) -> Value {
        let mut query = Map::new();
        query.insert(self.kind.clone(), Value::String(self.key.clone()));
        if let Some(getter) = &self.getter {
            query.insert("get".to_string(), Value::String(getter.clone()));
        }

        let mut document = Map::new();
        document.insert("ref".to_string(), Value::Object(query));
        Value::Object(document)
    }

    /// Recognizes `{<kind>: <key>, get: <getter>}`
    ///
    /// The kind must not be a special form or a reference keyword, key and getter are strings.
    pub fn from_document(document: &Map) -> Option<ExternalRef> {
        let getter = match document.get("get") {
            Some(Value::String(getter)) => Some(getter.clone()),
            Some(_) => return None,
            None => None,
        };

        let mut kinds = document.iter().filter(|(name, _)| *name != "get");
        let (kind, key) = match (kinds.next(), kinds.next()) {
            (Some((kind, Value::String(key))), None) => (kind, key),
            _ => return None,
        };

        if FORMS.contains(&kind.as_str()) || matches!(kind.as_str(), "ref" | "eval" | "vars") {
            return None;
        }

        Some(ExternalRef::new(kind.clone(), key.clone(), getter))
    }

    /// Fetches the value from the source registered for `kind`
    pub fn fetch(&self, tree: &ResourceTree) -> Result<ExternalValue, Error> {
        let source = tree
            .external_source(&self.kind)
            .ok_or_else(|| Error::UnknownExternal(self.kind.clone()))?;

        tracing::debug!(kind = %self.kind, key = %self.key, "fetching external value");
        let value = source
            .get(&self.key)
            .and_then(|value| match &self.getter {
                None => Ok(value),
                Some(getter) => value
                    .resolve_by_name(&Key::Name(getter.clone()), tree)?
                    .with_context(|| format!("no `{getter}` in the fetched value")),
            })
            .map_err(|source| Error::External {
                kind: self.kind.clone(),
                key: self.key.clone(),
                source,
            })?;

        Ok(ExternalValue::new(self.clone(), value))
    }
}

/// A fetched external value and the reference it came from
#[derive(Debug, Clone, PartialEq, derive_new::new)]
pub struct ExternalValue {
    pub reference: ExternalRef,
    pub value: Value,
}

impl ResolveByName for ExternalValue {
    fn resolve_by_name(&self, key: &Key, tree: &ResourceTree) -> Result<Option<Value>, Error> {
        self.value.resolve_by_name(key, tree)
    }

    fn members(&self, tree: &ResourceTree) -> Result<Vec<Value>, Error> {
        self.value.members(tree)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn document(source: &str) -> Map {
        serde_yaml::from_str(source).unwrap()
    }

    #[test]
    fn recognizes_queries() {
        assert_eq!(
            ExternalRef::from_document(&document("{secret: db, get: password}")),
            Some(ExternalRef::new(
                "secret".to_string(),
                "db".to_string(),
                Some("password".to_string())
            ))
        );
        assert_eq!(
            ExternalRef::from_document(&document("{env: HOME}")),
            Some(ExternalRef::new("env".to_string(), "HOME".to_string(), None))
        );

        for source in [
            "{if: a}",
            "{q: a}",
            "{ref: a}",
            "{env: [HOME]}",
            "{env: HOME, get: [x]}",
            "{env: HOME, secret: x}",
            "{get: x}",
        ] {
            assert_eq!(ExternalRef::from_document(&document(source)), None, "{source}");
        }
    }

    #[test]
    fn reference_document() {
        let reference = ExternalRef::new("secret".to_string(), "db".to_string(), Some("user".to_string()));
        assert_eq!(
            reference.as_ref_document(),
            serde_yaml::from_str::<Value>("{ref: {secret: db, get: user}}").unwrap()
        );
    }

    #[test]
    fn fetch_errors() {
        let mut tree = ResourceTree::default();
        tree.register_external("failing", |_: &str| -> anyhow::Result<Value> {
            anyhow::bail!("backend unavailable")
        });
        tree.register_external("plain", |key: &str| -> anyhow::Result<Value> {
            Ok(Value::from(key))
        });

        let error = ExternalRef::new("failing".to_string(), "x".to_string(), None)
            .fetch(&tree)
            .unwrap_err();
        assert_eq!(error.to_string(), "failed to fetch `x` from external source `failing`");
        assert!(matches!(error, Error::External { .. }));

        let error = ExternalRef::new("plain".to_string(), "x".to_string(), Some("field".to_string()))
            .fetch(&tree)
            .unwrap_err();
        assert!(matches!(error, Error::External { .. }));

        let value = ExternalRef::new("plain".to_string(), "x".to_string(), None)
            .fetch(&tree)
            .unwrap();
        assert_eq!(value.value, Value::from("x"));
    }

    #[test]
    fn environment() {
        let tree = ResourceTree::default();
        let dir = ExternalRef::new("env".to_string(), "CARGO_MANIFEST_DIR".to_string(), None);
        assert_eq!(
            dir.fetch(&tree).unwrap().value,
            Value::from(env!("CARGO_MANIFEST_DIR"))
        );

        let missing = ExternalRef::new("env".to_string(), "REFEVAL_SURELY_UNSET".to_string(), None);
        assert!(missing.fetch(&tree).is_err());
    }
}
