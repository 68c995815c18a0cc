use std::fmt;

use crate::types::ConcreteCommand;

/// A single literal value accepted inside a list marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    /// Integer literal outside the `i64` range, kept as its normalized digits.
    BigInt(String),
    Float(f64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::BigInt(digits) => f.write_str(digits),
            Scalar::Float(x) => write_float(f, *x),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

/// Shortest round-trip form; scientific with a signed two-digit exponent below 1e-4 or from 1e16.
fn write_float(f: &mut fmt::Formatter<'_>, x: f64) -> fmt::Result {
    let magnitude = x.abs();
    if !x.is_finite() || x == 0.0 || (1e-4..1e16).contains(&magnitude) {
        return if x.is_finite() && x.fract() == 0.0 {
            write!(f, "{x:.1}")
        } else {
            write!(f, "{x}")
        };
    }
    let sci = format!("{x:e}");
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return f.write_str(&sci);
    };
    let (sign, digits) = match exp.strip_prefix('-') {
        Some(d) => ('-', d),
        None => ('+', exp),
    };
    write!(f, "{mantissa}e{sign}{digits:0>2}")
}

/// Classification of one template token.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Scalar(Scalar),
    List(Vec<Scalar>),
    NotAListLiteral,
}

/// A token position that fans out into several values.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpansionMarker {
    pub index: usize,
    pub values: Vec<Scalar>,
}

/// Classify a token against the literal grammar.
///
/// Accepted forms:
/// - list: `[1, 2, 'a', "b", 3.5]`, trailing comma allowed, `[]` is an empty list
/// - tuple: `(1, 2)` or `(1,)`; `(1)` is just the scalar `1`
/// - scalar: integer, float, or single/double quoted string
///
/// Anything else, including nested containers, is `NotAListLiteral`.
pub fn parse_literal(token: &str) -> Literal {
    let mut p = Parser::new(token);
    p.skip_ws();
    let lit = match p.peek() {
        Some('[') => p.sequence('[', ']', false),
        Some('(') => p.sequence('(', ')', true),
        Some(_) => p.scalar().map(Literal::Scalar),
        None => None,
    };
    p.skip_ws();
    match lit {
        Some(lit) if p.at_end() => lit,
        _ => Literal::NotAListLiteral,
    }
}

/// Find the first marker at or after `from`.
pub fn find_marker(tokens: &[String], from: usize) -> Option<ExpansionMarker> {
    tokens
        .iter()
        .enumerate()
        .skip(from)
        .find_map(|(index, tok)| match parse_literal(tok) {
            Literal::List(values) => Some(ExpansionMarker { index, values }),
            _ => None,
        })
}

/// Expand a command template into the cartesian product of all marker values.
///
/// Markers are resolved left to right and values in literal order, so output is lexicographic
/// in marker position. A substituted value is split on whitespace into separate arguments.
/// An empty list prunes its branch.
pub fn expand(template: &[String]) -> Vec<ConcreteCommand> {
    let mut out = Vec::new();
    expand_from(template.to_vec(), 0, &mut out);
    out
}

fn expand_from(tokens: Vec<String>, from: usize, out: &mut Vec<ConcreteCommand>) {
    let Some(marker) = find_marker(&tokens, from) else {
        out.push(ConcreteCommand(tokens));
        return;
    };
    for value in &marker.values {
        let text = value.to_string();
        let mut next = Vec::with_capacity(tokens.len() + 1);
        next.extend_from_slice(&tokens[..marker.index]);
        next.extend(text.split_whitespace().map(str::to_string));
        next.extend_from_slice(&tokens[marker.index + 1..]);
        // tokens before the marker are already known not to be markers
        expand_from(next, marker.index, out);
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos == self.src.len()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
    }

    fn sequence(&mut self, open: char, close: char, tuple: bool) -> Option<Literal> {
        if !self.eat(open) {
            return None;
        }
        let mut items = Vec::new();
        let mut saw_comma = false;
        loop {
            self.skip_ws();
            if self.eat(close) {
                break;
            }
            items.push(self.scalar()?);
            self.skip_ws();
            if self.eat(',') {
                saw_comma = true;
                continue;
            }
            if self.eat(close) {
                break;
            }
            return None;
        }
        if tuple && items.len() == 1 && !saw_comma {
            return items.pop().map(Literal::Scalar);
        }
        Some(Literal::List(items))
    }

    fn scalar(&mut self) -> Option<Scalar> {
        match self.peek()? {
            q @ ('\'' | '"') => self.string(q).map(Scalar::Str),
            c if c.is_ascii_digit() || matches!(c, '+' | '-' | '.') => self.number(),
            _ => None,
        }
    }

    fn string(&mut self, quote: char) -> Option<String> {
        self.bump();
        let mut s = String::new();
        loop {
            match self.bump()? {
                c if c == quote => return Some(s),
                '\\' => match self.bump()? {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    'r' => s.push('\r'),
                    '0' => s.push('\0'),
                    c @ ('\\' | '\'' | '"') => s.push(c),
                    c => {
                        s.push('\\');
                        s.push(c);
                    }
                },
                c => s.push(c),
            }
        }
    }

    fn number(&mut self) -> Option<Scalar> {
        let start = self.pos;
        if matches!(self.peek(), Some('+' | '-')) {
            self.pos += 1;
        }
        let int_digits = self.digits();
        let mut is_float = false;
        let mut frac_digits = 0;
        if self.eat('.') {
            is_float = true;
            frac_digits = self.digits();
        }
        if int_digits == 0 && frac_digits == 0 {
            return None;
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek(), Some('+' | '-')) {
                self.pos += 1;
            }
            if self.digits() == 0 {
                return None;
            }
        }
        let text = &self.src[start..self.pos];
        if is_float {
            return text.parse().ok().map(Scalar::Float);
        }
        Some(match text.parse() {
            Ok(i) => Scalar::Int(i),
            Err(_) => Scalar::BigInt(normalize_digits(text)),
        })
    }

    fn digits(&mut self) -> usize {
        let n = self.rest().bytes().take_while(u8::is_ascii_digit).count();
        self.pos += n;
        n
    }
}

/// Drop a leading `+` and leading zeros from an integer lexeme.
fn normalize_digits(text: &str) -> String {
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let digits = digits.trim_start_matches('0');
    match (negative, digits.is_empty()) {
        (_, true) => "0".to_string(),
        (true, false) => format!("-{digits}"),
        (false, false) => digits.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn rendered(v: &[&str]) -> Vec<String> {
        expand(&toks(v)).iter().map(ConcreteCommand::render).collect()
    }

    #[test]
    fn classifies_lists_and_scalars() {
        assert_eq!(
            parse_literal("[1, 'a', \"b\", 2.5]"),
            Literal::List(vec![
                Scalar::Int(1),
                Scalar::Str("a".into()),
                Scalar::Str("b".into()),
                Scalar::Float(2.5),
            ])
        );
        assert_eq!(parse_literal("[]"), Literal::List(vec![]));
        assert_eq!(parse_literal("[1,2,]"), Literal::List(vec![Scalar::Int(1), Scalar::Int(2)]));
        assert_eq!(parse_literal("(1,)"), Literal::List(vec![Scalar::Int(1)]));
        assert_eq!(parse_literal("(7)"), Literal::Scalar(Scalar::Int(7)));
        assert_eq!(parse_literal("-3"), Literal::Scalar(Scalar::Int(-3)));
        assert_eq!(parse_literal("'x'"), Literal::Scalar(Scalar::Str("x".into())));
    }

    #[test]
    fn rejects_anything_else() {
        for tok in [
            "echo",
            "[1,[2]]",
            "[a]",
            "[1 2]",
            "[1,2",
            "__import__('os')",
            "[1]x",
            "file[1].txt",
            "",
            "-",
            ".",
            "1e",
        ] {
            assert_eq!(parse_literal(tok), Literal::NotAListLiteral, "token {tok:?}");
        }
    }

    #[test]
    fn scalar_text_forms() {
        assert_eq!(Scalar::Int(-4).to_string(), "-4");
        assert_eq!(Scalar::Float(2.0).to_string(), "2.0");
        assert_eq!(Scalar::Float(0.25).to_string(), "0.25");
        assert_eq!(Scalar::Float(1e16).to_string(), "1e+16");
        assert_eq!(Scalar::Float(-2.5e20).to_string(), "-2.5e+20");
        assert_eq!(Scalar::Float(1e-5).to_string(), "1e-05");
        assert_eq!(Scalar::Float(1.5e-5).to_string(), "1.5e-05");
        assert_eq!(Scalar::Float(1e-4).to_string(), "0.0001");
        assert_eq!(Scalar::Float(1e15).to_string(), "1000000000000000.0");
        assert_eq!(Scalar::Float(1e300).to_string(), "1e+300");
        assert_eq!(Scalar::Float(0.0).to_string(), "0.0");
        assert_eq!(Scalar::Str("a b".into()).to_string(), "a b");
    }

    #[test]
    fn integers_beyond_i64_keep_their_digits() {
        assert_eq!(
            parse_literal("[99999999999999999999, 1]"),
            Literal::List(vec![
                Scalar::BigInt("99999999999999999999".into()),
                Scalar::Int(1),
            ])
        );
        assert_eq!(
            parse_literal("-0099999999999999999999"),
            Literal::Scalar(Scalar::BigInt("-99999999999999999999".into()))
        );
        assert_eq!(
            rendered(&["echo", "[1e16, 1e-5, 99999999999999999999]"]),
            vec!["echo 1e+16", "echo 1e-05", "echo 99999999999999999999"]
        );
    }

    #[test]
    fn no_marker_is_identity() {
        assert_eq!(rendered(&["ls", "-l", "/tmp"]), vec!["ls -l /tmp"]);
    }

    #[test]
    fn single_marker() {
        assert_eq!(rendered(&["echo", "[1,2,3]"]), vec!["echo 1", "echo 2", "echo 3"]);
    }

    #[test]
    fn two_markers_cartesian_in_order() {
        assert_eq!(
            rendered(&["ping", "-c", "['1','2']", "(\"a\", \"b\", \"c\")"]),
            vec![
                "ping -c 1 a",
                "ping -c 1 b",
                "ping -c 1 c",
                "ping -c 2 a",
                "ping -c 2 b",
                "ping -c 2 c",
            ]
        );
    }

    #[test]
    fn empty_list_prunes_branch() {
        assert!(expand(&toks(&["echo", "[]", "[1,2]"])).is_empty());
    }

    #[test]
    fn values_split_on_whitespace() {
        let cmds = expand(&toks(&["echo", "['a b', 'c']"]));
        assert_eq!(cmds[0], ConcreteCommand::new(["echo", "a", "b"]));
        assert_eq!(cmds[1], ConcreteCommand::new(["echo", "c"]));
    }

    #[test]
    fn quoted_list_value_expands_again() {
        assert_eq!(rendered(&["echo", "['[1,2]']"]), vec!["echo 1", "echo 2"]);
    }

    #[test]
    fn incidental_brackets_stay_literal() {
        assert_eq!(rendered(&["grep", "[a-z]+", "[x]"]), vec!["grep [a-z]+ [x]"]);
    }
}
