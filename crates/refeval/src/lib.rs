//! # refeval - reference evaluation over resource graphs
//!
//! ## Introduction for developers
//!
//! Read this to understand how `refeval` works internally.
//!
//! ### Terms
//!
//! - a `resource` is a named node in a [ResourceTree] with attributes, a parent and children
//! - a `path expression` (see [path]) addresses values starting at some value, e.g.
//!   `web::ports[.=80]`
//! - a `reference document` is a mapping with a `ref` (or `eval`) key and optional `vars`
//!   and `foreach` keys, see [Ref]
//! - a `special form` is a mapping with exactly one key of `if`, `and`, `or`, `not`, `q` or
//!   `lookup`, see [expr::Expr]
//! - an `external value` comes from a registered [ExternalSource] and keeps its reference
//!   when written back, see [external]
//!
//! A manifest like this
//! ```yaml
//! name: site
//! attributes:
//!   domain: example.com
//! resources:
//!   - name: web
//!     attributes:
//!       url: {ref: domain}
//!       ports: [80, 443]
//! ```
//! describes two resources. `web::url` resolves to `example.com` by inheriting `domain`
//! from `site`.
//!
//! ### Results
//!
//! Attributes are stored as raw data and resolved on first access. Each resolved slot is
//! memoized in a [results::CachedResult] together with the raw value it came from, so
//! [Results::serialize] can write back the original references and [Results::get_diff]
//! can report what changed after mutation through [results::ResultsMut].
//!
//! ```
//! # use refeval::{resource_tree, Value};
//! let tree = resource_tree!(r#"
//! name: site
//! attributes:
//!   domain: example.com
//!   url: {ref: domain}
//! "#);
//! let site = tree.find("site").unwrap();
//! assert_eq!(tree.resolve_one(site, "url").unwrap(), Value::from("example.com"));
//! ```
//!
//! ### Evaluation order
//!
//! 1. a reference document is compiled once into an [expr::Expr]
//! 2. its `vars` are resolved in order, each seeing the ones before it
//! 3. path expressions walk segment by segment, broadcasting over sequences
//! 4. results are wrapped lazily: mappings and sequences become [results::Results] views
//!
//! Cycles are reported as [Error::Cycle], runaway recursion as [Error::RecursionLimit].
pub mod error;
pub mod eval;
pub mod expr;
pub mod external;
pub mod manifest;
pub mod path;
pub mod resource;
pub mod results;
pub mod template;
pub mod value;

pub use error::Error;
pub use eval::{EvalContext, Vars};
pub use expr::Ref;
pub use external::{ExternalRef, ExternalSource, ExternalValue};
pub use path::Path;
pub use resource::{Limits, ResourceId, ResourceTree, SerializeOptions};
pub use results::{CachedResult, Results, ResultsMut};
pub use template::{Interpolate, Templater, Verbatim};
pub use value::{Map, Value};
