//! String templating
//!
//! Plain strings read from a result cache or produced by [map_value](crate::expr::map_value)
//! pass through the tree's [Templater] together with the variables in scope.
use crate::eval::Vars;
use regex::{Captures, Regex};
use std::sync::LazyLock;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("undefined template variable `{0}`")]
    Undefined(String),

    #[error("template variable `{0}` is not a scalar")]
    NotScalar(String),
}

/// Renders a template string with the given bindings
pub trait Templater {
    fn render(&self, template: &str, vars: &Vars) -> Result<String, TemplateError>;
}

impl<F> Templater for F
where
    F: Fn(&str, &Vars) -> Result<String, TemplateError>,
{
    fn render(&self, template: &str, vars: &Vars) -> Result<String, TemplateError> {
        self(template, vars)
    }
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// Replaces `{{ name }}` with the text of the bound scalar
#[derive(Debug, Default, Clone, Copy)]
pub struct Interpolate;

impl Templater for Interpolate {
    fn render(&self, template: &str, vars: &Vars) -> Result<String, TemplateError> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }

        let mut error = None;
        let rendered = PLACEHOLDER.replace_all(template, |captures: &Captures| {
            let name = &captures[1];
            let text = match vars.get(name) {
                Some(value) => value
                    .scalar_text()
                    .ok_or_else(|| TemplateError::NotScalar(name.to_string())),
                None => Err(TemplateError::Undefined(name.to_string())),
            };
            text.unwrap_or_else(|e| {
                error.get_or_insert(e);
                String::new()
            })
        });

        if let Some(error) = error {
            tracing::debug!(template, %error, "template rendering failed");
            return Err(error);
        }

        Ok(rendered.into_owned())
    }
}

/// Leaves every string unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct Verbatim;

impl Templater for Verbatim {
    fn render(&self, template: &str, _vars: &Vars) -> Result<String, TemplateError> {
        Ok(template.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::Value;
    use pretty_assertions::assert_eq;

    fn vars() -> Vars {
        Vars::from_iter([
            ("foo".to_string(), Value::from("hello")),
            ("n".to_string(), Value::Integer(3)),
            ("list".to_string(), Value::Array(vec![])),
        ])
    }

    #[test]
    fn interpolate() {
        assert_eq!(Interpolate.render(" {{ foo }} ", &vars()).unwrap(), " hello ");
        assert_eq!(Interpolate.render("{{foo}}-{{ n }}", &vars()).unwrap(), "hello-3");
        assert_eq!(Interpolate.render("no placeholders", &vars()).unwrap(), "no placeholders");
        assert_eq!(Interpolate.render("{{ not a name }}", &vars()).unwrap(), "{{ not a name }}");
    }

    #[test]
    fn interpolate_errors() {
        assert_eq!(
            Interpolate.render("{{ missing }}", &vars()),
            Err(TemplateError::Undefined("missing".to_string()))
        );
        assert_eq!(
            Interpolate.render("{{ list }}", &vars()),
            Err(TemplateError::NotScalar("list".to_string()))
        );
    }

    #[test]
    fn verbatim_and_closures() {
        assert_eq!(Verbatim.render("{{ missing }}", &vars()).unwrap(), "{{ missing }}");

        let upper = |template: &str, _: &Vars| -> Result<String, TemplateError> {
            Ok(template.to_uppercase())
        };
        assert_eq!(upper.render("abc", &vars()).unwrap(), "ABC");
    }
}
