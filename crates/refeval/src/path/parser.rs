use super::{Comparator, Key, Modifier, Operand, Path, Segment, Test};

/// Filters nested deeper than this are rejected
const MAX_NESTING: usize = 64;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid expression `{expression}` at offset {offset}: {message}")]
pub struct SyntaxError {
    pub expression: String,
    pub offset: usize,
    pub message: &'static str,
}

pub(super) struct Parser<'s> {
    source: &'s str,
    pos: usize,
    depth: usize,
}

impl<'s> Parser<'s> {
    pub fn new(source: &'s str) -> Self {
        Self {
            source,
            pos: 0,
            depth: 0,
        }
    }

    pub fn parse(mut self) -> Result<Path, SyntaxError> {
        if self.source.trim().is_empty() {
            return Err(self.error(0, "empty expression"));
        }

        let path = self.path()?;

        // a top level path only stops early on a `]` without matching `[`
        if self.pos < self.source.len() {
            return Err(self.error(self.pos, "unbalanced `]`"));
        }

        tracing::trace!(source = self.source, %path, "parsed");
        Ok(path)
    }

    fn path(&mut self) -> Result<Path, SyntaxError> {
        let mut segments = vec![self.segment()?];
        while self.eat_separator() {
            segments.push(self.segment()?);
        }

        Ok(Path(segments))
    }

    fn segment(&mut self) -> Result<Segment, SyntaxError> {
        let start = self.pos;
        let head = self.text();
        let mut segment = parse_segment_text(head).map_err(|message| self.error(start, message))?;

        while self.peek() == Some('[') {
            let open = self.pos;
            self.pos += 1;
            self.depth += 1;
            if self.depth > MAX_NESTING {
                return Err(self.error(open, "filters are nested too deeply"));
            }

            let filter = self.path()?;
            if self.peek() != Some(']') {
                return Err(self.error(open, "unclosed `[`"));
            }
            self.pos += 1;
            self.depth -= 1;
            segment.filters.push(filter);

            // text after `]` continues the same segment, e.g. `a[b]?` or `a[b]=4`
            let tail_start = self.pos;
            let tail = self.text();
            if tail.trim().is_empty() {
                continue;
            }

            let continued =
                parse_segment_text(tail).map_err(|message| self.error(tail_start, message))?;
            if !continued.key.is_empty() {
                return Err(self.error(tail_start, "unexpected key after filter"));
            }
            if continued.test.is_some() {
                segment.test = continued.test;
            }
            if continued.modifier != Modifier::None {
                segment.modifier = continued.modifier;
            }
        }

        Ok(segment)
    }

    /// Consumes segment text up to the next `::`, `[`, `]` or the end
    fn text(&mut self) -> &'s str {
        let source = self.source;
        let rest = &source[self.pos..];
        let end = rest
            .char_indices()
            .find(|(index, c)| *c == '[' || *c == ']' || rest[*index..].starts_with("::"))
            .map_or(rest.len(), |(index, _)| index);

        self.pos += end;
        &rest[..end]
    }

    fn eat_separator(&mut self) -> bool {
        if self.source[self.pos..].starts_with("::") {
            self.pos += 2;
            true
        } else {
            false
        }
    }

    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn error(&self, offset: usize, message: &'static str) -> SyntaxError {
        SyntaxError {
            expression: self.source.to_string(),
            offset,
            message,
        }
    }
}

/// Parses the text of a single segment: modifier, key and test
fn parse_segment_text(text: &str) -> Result<Segment, &'static str> {
    let mut text = text.trim();
    let mut modifier = Modifier::None;

    // a leading `!` wins over `!=`: `!=x` is the negation of `=x`
    if let Some(rest) = text.strip_prefix('!') {
        modifier = Modifier::Negate;
        text = rest;
    } else if let Some(rest) = text.strip_suffix('?') {
        modifier = Modifier::First;
        text = rest;
    }

    let (key, test) = match split_test(text) {
        Some((key, comparator, operand)) => {
            (key, Some(Test::new(comparator, parse_operand(operand.trim())?)))
        }
        None => (text, None),
    };

    Ok(Segment {
        key: parse_key(key.trim())?,
        test,
        modifier,
        filters: vec![],
    })
}

fn split_test(text: &str) -> Option<(&str, Comparator, &str)> {
    let eq = text.find('=')?;
    let operand = &text[eq + 1..];

    match text[..eq].strip_suffix('!') {
        Some(key) => Some((key, Comparator::NotEquals, operand)),
        None => Some((&text[..eq], Comparator::Equals, operand)),
    }
}

fn parse_key(text: &str) -> Result<Key, &'static str> {
    if text.is_empty() {
        return Ok(Key::Empty);
    }

    if let Some(name) = text.strip_prefix('$') {
        if name.is_empty() {
            return Err("`$` must be followed by a variable name");
        }
        return Ok(Key::Var(name.to_string()));
    }

    Ok(text
        .parse::<i64>()
        .map_or_else(|_| Key::Name(text.to_string()), Key::Index))
}

fn parse_operand(text: &str) -> Result<Operand, &'static str> {
    match text.strip_prefix('$') {
        Some("") => Err("`$` must be followed by a variable name"),
        Some(name) => Ok(Operand::Var(name.to_string())),
        None => Ok(Operand::Literal(text.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn name(name: &str) -> Segment {
        Segment::new(Key::Name(name.to_string()))
    }

    fn filter(source: &str) -> Path {
        Path::parse(source).expect("filter must parse")
    }

    #[test]
    fn keys() {
        let path = Path::parse("a::0::$v::-1").unwrap();
        assert_eq!(
            path.segments(),
            &[
                name("a"),
                Segment::new(Key::Index(0)),
                Segment::new(Key::Var("v".to_string())),
                Segment::new(Key::Index(-1)),
            ]
        );
    }

    #[test]
    fn filters_attach_to_preceding_segment() {
        let path = Path::parse("x::a[c=4]::b").unwrap();
        let mut a = name("a");
        a.filters.push(filter("c=4"));
        assert_eq!(path.segments(), &[name("x"), a, name("b")]);
    }

    #[test]
    fn leading_filter_uses_current_value() {
        let path = Path::parse("[b::2]::b").unwrap();
        assert_eq!(path.first().key, Key::Empty);
        assert_eq!(path.first().filters, vec![filter("b::2")]);
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn tests_and_modifiers() {
        let path = Path::parse("a!=$x").unwrap();
        assert_eq!(
            path.first().test,
            Some(Test::new(Comparator::NotEquals, Operand::Var("x".to_string())))
        );

        let path = Path::parse("!=blah").unwrap();
        assert_eq!(path.first().modifier, Modifier::Negate);
        assert_eq!(
            path.first().test,
            Some(Test::new(
                Comparator::Equals,
                Operand::Literal("blah".to_string())
            ))
        );

        let path = Path::parse("a?").unwrap();
        assert_eq!(path.first().modifier, Modifier::First);
    }

    #[test]
    fn text_after_filter_continues_segment() {
        let path = Path::parse("a[b]?::c").unwrap();
        assert_eq!(path.first().modifier, Modifier::First);
        assert_eq!(path.first().filters, vec![filter("b")]);

        let path = Path::parse("a[b][c]=4").unwrap();
        assert_eq!(path.first().filters.len(), 2);
        assert_eq!(
            path.first().test,
            Some(Test::new(Comparator::Equals, Operand::Literal("4".to_string())))
        );
    }

    #[test]
    fn nested_filters() {
        let path = Path::parse("a[b[c=1]::d]").unwrap();
        let inner = &path.first().filters[0];
        assert_eq!(inner.first().filters, vec![filter("c=1")]);
        assert_eq!(inner.segments()[1], name("d"));
    }

    #[test]
    fn anchored() {
        let path = Path::parse("::name").unwrap().anchored();
        assert_eq!(path.to_string(), ".ancestors::?::name");

        let path = Path::parse("[a]").unwrap().anchored();
        assert_eq!(path.to_string(), "[a]");
    }

    #[test]
    fn display_round_trip() {
        for source in ["x::a[c=4]::b", "a[!b]::c", "d[a=va][a!=vb]", "$v::x?", "b::-1"] {
            let path = Path::parse(source).unwrap();
            assert_eq!(path.to_string(), source);
            assert_eq!(Path::parse(&path.to_string()).unwrap(), path);
        }
    }

    #[test]
    fn syntax_errors() {
        for (source, message) in [
            ("", "empty expression"),
            ("a[b", "unclosed `[`"),
            ("a]", "unbalanced `]`"),
            ("a[b]]", "unbalanced `]`"),
            ("a[b]c", "unexpected key after filter"),
            ("$::a", "`$` must be followed by a variable name"),
            ("a=$", "`$` must be followed by a variable name"),
        ] {
            let error = Path::parse(source).expect_err(source);
            assert_eq!(error.message, message, "expression: {source}");
        }
    }

    #[test]
    fn nesting_limit() {
        let source = format!("{}a{}", "[".repeat(MAX_NESTING + 1), "]".repeat(MAX_NESTING + 1));
        let error = Path::parse(&source).expect_err("too deep");
        assert_eq!(error.message, "filters are nested too deeply");
    }
}
