use crate::path::SyntaxError;
use crate::template::TemplateError;

/// Errors raised while evaluating expressions or reading results
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error("reference cycle while resolving `{key}` of resource `{resource}`")]
    Cycle { resource: String, key: String },

    #[error("undefined variable `${0}`")]
    UndefinedVariable(String),

    #[error("evaluation exceeded the nesting limit of {0}")]
    RecursionLimit(usize),

    #[error("no external source registered for `{0}`")]
    UnknownExternal(String),

    #[error("failed to fetch `{key}` from external source `{kind}`")]
    External {
        kind: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("template rendering failed")]
    Template(#[from] TemplateError),

    #[error("invalid `{form}` expression: {message}")]
    InvalidForm {
        form: &'static str,
        message: &'static str,
    },

    #[error("not a reference: {0}")]
    NotAReference(String),

    #[error("invalid mutation: {0}")]
    InvalidMutation(&'static str),
}
