//! Path expressions
//!
//! A path expression locates values in the resource graph. It is a `::` delimited list of
//! [Segment]s:
//!
//! ```text
//! expr:    segment? ('::' segment)*
//! segment: key? ('[' filter ']')* '?'?
//! key:     name | integer | var
//! filter:  '!'? expr? (('!=' | '=') test)?
//! test:    var | literal
//! var:     '$' name
//! ```
//!
//! `::` is used as the delimiter so keys may contain `.` and `/`.
//!
//! Examples
//! - `x::a[c=4]::b`: key `x`, then key `a` where `a::c` equals `4`, then key `b`
//! - `a[!b]`: `a` when it has no `b`
//! - `a?::b`: `a`, but stop after the first item that yields something
//! - `[x]`: the current value if it has an `x`
//! - `$var::name`: start at the value bound to `var`
mod parser;

use std::fmt::{Display, Formatter};

pub use parser::SyntaxError;

/// Key of a [Segment]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Key {
    /// No key: the current value itself
    #[default]
    Empty,
    Name(String),
    /// Integer-looking keys, index into sequences (negative counts from the end)
    Index(i64),
    /// `$name`, looked up in the evaluation's variables
    Var(String),
}

impl Key {
    pub fn is_index(&self) -> bool {
        matches!(self, Key::Index(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Key::Empty)
    }

    /// `*`, matching every member of a mapping or sequence
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Key::Name(name) if name == "*")
    }

    /// Name used when addressing a string keyed mapping
    pub fn as_name(&self) -> Option<std::borrow::Cow<'_, str>> {
        match self {
            Key::Name(name) => Some(name.as_str().into()),
            Key::Index(index) => Some(index.to_string().into()),
            Key::Empty | Key::Var(_) => None,
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Empty => Ok(()),
            Key::Name(name) => f.write_str(name),
            Key::Index(index) => write!(f, "{index}"),
            Key::Var(name) => write!(f, "${name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equals,
    NotEquals,
}

/// Right hand side of a [Test]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Coerced into the type of the tested value before comparing
    Literal(String),
    Var(String),
}

#[derive(Debug, Clone, PartialEq, Eq, derive_new::new)]
pub struct Test {
    pub comparator: Comparator,
    pub operand: Operand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modifier {
    #[default]
    None,
    /// `!`: a filter matches when it yields nothing
    Negate,
    /// `?`: stop after the first match
    First,
}

/// One `::` separated unit of a [Path]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Segment {
    pub key: Key,
    pub test: Option<Test>,
    pub modifier: Modifier,
    pub filters: Vec<Path>,
}

impl Segment {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }

    /// A segment without key, test, modifier or filters
    fn is_bare(&self) -> bool {
        self.key.is_empty()
            && self.test.is_none()
            && self.modifier == Modifier::None
            && self.filters.is_empty()
    }
}

/// A parsed path expression, never empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path(Vec<Segment>);

impl Path {
    pub fn parse(source: &str) -> Result<Path, SyntaxError> {
        parser::Parser::new(source).parse()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn first(&self) -> &Segment {
        &self.0[0]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Same path, but the first segment's key replaced by [Key::Empty]
    pub(crate) fn rebased(&self) -> Path {
        let mut segments = self.0.clone();
        segments[0].key = Key::Empty;
        Path(segments)
    }

    /// Rewrites a path starting with `::` to search the ancestors of the current resource
    ///
    /// `::a::b` becomes `.ancestors::?::a::b`: the first ancestor from which `a::b` resolves.
    pub(crate) fn anchored(mut self) -> Path {
        if self.0.len() > 1 && self.0[0].is_bare() {
            self.0[0].modifier = Modifier::First;
            self.0
                .insert(0, Segment::new(Key::Name(".ancestors".to_string())));
        }
        self
    }
}

impl std::str::FromStr for Path {
    type Err = SyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.modifier == Modifier::Negate {
            f.write_str("!")?;
        }
        write!(f, "{}", self.key)?;
        if let Some(test) = &self.test {
            match test.comparator {
                Comparator::Equals => f.write_str("=")?,
                Comparator::NotEquals => f.write_str("!=")?,
            }
            match &test.operand {
                Operand::Literal(literal) => f.write_str(literal)?,
                Operand::Var(name) => write!(f, "${name}")?,
            }
        }
        for filter in &self.filters {
            write!(f, "[{filter}]")?;
        }
        if self.modifier == Modifier::First {
            f.write_str("?")?;
        }
        Ok(())
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (index, segment) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("::")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}
