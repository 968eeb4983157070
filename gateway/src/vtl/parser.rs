//! Template source to AST.

use std::rc::Rc;

use serde_json::{Number, Value};

use super::RenderError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Text(String),
    Reference(Reference),
    Set {
        target: Reference,
        value: Expr,
    },
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
    Foreach {
        var: String,
        iterable: Expr,
        body: Vec<Node>,
    },
    Define {
        name: String,
        body: Rc<Vec<Node>>,
    },
    Break,
    /// `#stop`: no further output from the whole template.
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reference {
    pub root: String,
    pub chain: Vec<Accessor>,
    /// `$!x`: render nothing rather than the source text when unresolved.
    pub quiet: bool,
    /// Source text, rendered verbatim for unknown references.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Accessor {
    Property(String),
    Method(String, Vec<Expr>),
    Index(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    /// A double-quoted string containing references or directives.
    Interpolated(Vec<Node>),
    Ref(Reference),
    List(Vec<Expr>),
    Range(Box<Expr>, Box<Expr>),
    Map(Vec<(Expr, Expr)>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

type Result<T> = std::result::Result<T, RenderError>;

pub(crate) fn parse(source: &str) -> Result<Vec<Node>> {
    let mut parser = Parser::new(source);
    let (nodes, _) = parser.parse_block(&[])?;
    Ok(nodes)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        let mut i = self.pos;
        for c in s.chars() {
            if self.chars.get(i) != Some(&c) {
                return false;
            }
            i += 1;
        }
        true
    }

    fn eat(&mut self, s: &str) -> bool {
        if self.starts_with(s) {
            self.pos += s.chars().count();
            true
        } else {
            false
        }
    }

    /// Like [`Parser::eat`] for word operators: `and` must not be the start of `android`.
    fn eat_word(&mut self, word: &str) -> bool {
        let len = word.chars().count();
        if self.starts_with(word) && !self.chars.get(self.pos + len).is_some_and(|c| is_ident(*c)) {
            self.pos += len;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{c}'")))
        }
    }

    fn error(&self, message: impl Into<String>) -> RenderError {
        let line = self.chars[..self.pos.min(self.chars.len())]
            .iter()
            .filter(|c| **c == '\n')
            .count()
            + 1;
        RenderError::Parse {
            line,
            message: message.into(),
        }
    }

    fn identifier(&mut self) -> Option<String> {
        if !self.peek().is_some_and(is_ident_start) {
            return None;
        }
        let start = self.pos;
        while self.peek().is_some_and(is_ident) {
            self.pos += 1;
        }
        Some(self.chars[start..self.pos].iter().collect())
    }

    /// Parse text and directives until EOF or one of `terminators` (`end`, `else`, `elseif`).
    fn parse_block(
        &mut self,
        terminators: &[&'static str],
    ) -> Result<(Vec<Node>, Option<&'static str>)> {
        let mut nodes = Vec::new();
        let mut text = String::new();

        fn flush(text: &mut String, nodes: &mut Vec<Node>) {
            if !text.is_empty() {
                nodes.push(Node::Text(std::mem::take(text)));
            }
        }

        loop {
            let Some(c) = self.peek() else {
                flush(&mut text, &mut nodes);
                if terminators.is_empty() {
                    return Ok((nodes, None));
                }
                return Err(self.error("unexpected end of template, missing #end"));
            };

            match c {
                '\\' if matches!(self.peek_at(1), Some('$' | '#')) => {
                    self.pos += 1;
                    text.push(self.chars[self.pos]);
                    self.pos += 1;
                }
                '#' if self.starts_with("##") => self.skip_line_comment(),
                '#' if self.starts_with("#*") => self.skip_block_comment()?,
                '#' => {
                    let start = self.pos;
                    let Some(name) = self.directive_name() else {
                        self.pos = start + 1;
                        text.push('#');
                        continue;
                    };
                    match name.as_str() {
                        "end" | "else" | "elseif" => {
                            let Some(t) = terminators.iter().find(|t| **t == name) else {
                                return Err(self.error(format!("unexpected #{name}")));
                            };
                            flush(&mut text, &mut nodes);
                            return Ok((nodes, Some(*t)));
                        }
                        "set" => {
                            flush(&mut text, &mut nodes);
                            nodes.push(self.parse_set()?);
                        }
                        "if" => {
                            flush(&mut text, &mut nodes);
                            nodes.push(self.parse_if()?);
                        }
                        "foreach" => {
                            flush(&mut text, &mut nodes);
                            nodes.push(self.parse_foreach()?);
                        }
                        "define" => {
                            flush(&mut text, &mut nodes);
                            nodes.push(self.parse_define()?);
                        }
                        "break" => {
                            flush(&mut text, &mut nodes);
                            nodes.push(Node::Break);
                        }
                        "stop" => {
                            flush(&mut text, &mut nodes);
                            nodes.push(Node::Stop);
                        }
                        _ => {
                            self.pos = start + 1;
                            text.push('#');
                        }
                    }
                }
                '$' => {
                    let start = self.pos;
                    match self.parse_reference()? {
                        Some(r) => {
                            flush(&mut text, &mut nodes);
                            nodes.push(Node::Reference(r));
                        }
                        None => {
                            self.pos = start + 1;
                            text.push('$');
                        }
                    }
                }
                _ => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == '\n' {
                break;
            }
        }
    }

    fn skip_block_comment(&mut self) -> Result<()> {
        let start = self.pos;
        self.pos += 2;
        while self.pos < self.chars.len() {
            if self.eat("*#") {
                return Ok(());
            }
            self.pos += 1;
        }
        self.pos = start;
        Err(self.error("unterminated #* comment"))
    }

    /// `#name` or `#{name}`; leaves `pos` after the name.
    fn directive_name(&mut self) -> Option<String> {
        self.pos += 1;
        if self.peek() == Some('{') {
            self.pos += 1;
            let name = self.identifier()?;
            if self.peek() != Some('}') {
                return None;
            }
            self.pos += 1;
            return Some(name);
        }
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        Some(self.chars[start..self.pos].iter().collect())
    }

    fn open_args(&mut self, directive: &str) -> Result<()> {
        while self.peek().is_some_and(|c| c == ' ' || c == '\t') {
            self.pos += 1;
        }
        if self.peek() != Some('(') {
            return Err(self.error(format!("expected '(' after #{directive}")));
        }
        self.pos += 1;
        Ok(())
    }

    fn required_reference(&mut self) -> Result<Reference> {
        self.skip_ws();
        if self.peek() != Some('$') {
            return Err(self.error("expected a reference"));
        }
        self.parse_reference()?
            .ok_or_else(|| self.error("expected a reference"))
    }

    fn parse_set(&mut self) -> Result<Node> {
        self.open_args("set")?;
        let target = self.required_reference()?;
        self.expect('=')?;
        let value = self.parse_expr()?;
        self.expect(')')?;
        Ok(Node::Set { target, value })
    }

    fn parse_condition(&mut self, directive: &str) -> Result<Expr> {
        self.open_args(directive)?;
        let cond = self.parse_expr()?;
        self.expect(')')?;
        Ok(cond)
    }

    fn parse_if(&mut self) -> Result<Node> {
        const TERMINATORS: &[&str] = &["elseif", "else", "end"];

        let cond = self.parse_condition("if")?;
        let (body, mut term) = self.parse_block(TERMINATORS)?;
        let mut branches = vec![(cond, body)];
        let mut otherwise = Vec::new();
        loop {
            match term {
                Some("elseif") => {
                    let cond = self.parse_condition("elseif")?;
                    let (body, next) = self.parse_block(TERMINATORS)?;
                    branches.push((cond, body));
                    term = next;
                }
                Some("else") => {
                    let (body, _) = self.parse_block(&["end"])?;
                    otherwise = body;
                    break;
                }
                _ => break,
            }
        }
        Ok(Node::If {
            branches,
            otherwise,
        })
    }

    fn parse_foreach(&mut self) -> Result<Node> {
        self.open_args("foreach")?;
        let var = self.required_reference()?;
        if !var.chain.is_empty() {
            return Err(self.error("#foreach variable must be a plain reference"));
        }
        self.skip_ws();
        if !self.eat_word("in") {
            return Err(self.error("expected 'in' in #foreach"));
        }
        let iterable = self.parse_expr()?;
        self.expect(')')?;
        let (body, _) = self.parse_block(&["end"])?;
        Ok(Node::Foreach {
            var: var.root,
            iterable,
            body,
        })
    }

    fn parse_define(&mut self) -> Result<Node> {
        self.open_args("define")?;
        let name = self.required_reference()?;
        if !name.chain.is_empty() {
            return Err(self.error("#define name must be a plain reference"));
        }
        self.expect(')')?;
        let (body, _) = self.parse_block(&["end"])?;
        Ok(Node::Define {
            name: name.root,
            body: Rc::new(body),
        })
    }

    /// At a `$`. Returns `None` (with `pos` unspecified) when this isn't a reference.
    fn parse_reference(&mut self) -> Result<Option<Reference>> {
        let start = self.pos;
        self.pos += 1;
        let quiet = self.eat("!");
        let braced = self.eat("{");
        let Some(root) = self.identifier() else {
            return Ok(None);
        };

        let mut chain = Vec::new();
        loop {
            match self.peek() {
                Some('.') if self.peek_at(1).is_some_and(is_ident_start) => {
                    self.pos += 1;
                    let Some(name) = self.identifier() else {
                        break;
                    };
                    if self.peek() == Some('(') {
                        self.pos += 1;
                        let args = self.parse_args(')')?;
                        chain.push(Accessor::Method(name, args));
                    } else {
                        chain.push(Accessor::Property(name));
                    }
                }
                Some('[') => {
                    self.pos += 1;
                    let index = self.parse_expr()?;
                    self.expect(']')?;
                    chain.push(Accessor::Index(index));
                }
                _ => break,
            }
        }

        if braced && !self.eat("}") {
            return Ok(None);
        }
        Ok(Some(Reference {
            root,
            chain,
            quiet,
            source: self.chars[start..self.pos].iter().collect(),
        }))
    }

    fn parse_args(&mut self, close: char) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek() == Some(close) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(c) if c == close => {
                    self.pos += 1;
                    return Ok(args);
                }
                _ => return Err(self.error(format!("expected ',' or '{close}'"))),
            }
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        loop {
            self.skip_ws();
            if self.eat("||") || self.eat_word("or") {
                let rhs = self.parse_and()?;
                lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_equality()?;
        loop {
            self.skip_ws();
            if self.eat("&&") || self.eat_word("and") {
                let rhs = self.parse_equality()?;
                lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_relational()?;
        loop {
            self.skip_ws();
            let op = if self.eat("==") || self.eat_word("eq") {
                BinOp::Eq
            } else if self.eat("!=") || self.eat_word("ne") {
                BinOp::Ne
            } else {
                return Ok(lhs);
            };
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_relational(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            self.skip_ws();
            let op = if self.eat("<=") || self.eat_word("le") {
                BinOp::Le
            } else if self.eat(">=") || self.eat_word("ge") {
                BinOp::Ge
            } else if self.eat("<") || self.eat_word("lt") {
                BinOp::Lt
            } else if self.eat(">") || self.eat_word("gt") {
                BinOp::Gt
            } else {
                return Ok(lhs);
            };
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            self.skip_ws();
            let op = if self.eat("+") {
                BinOp::Add
            } else if self.eat("-") {
                BinOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            self.skip_ws();
            let op = if self.eat("*") {
                BinOp::Mul
            } else if self.eat("/") {
                BinOp::Div
            } else if self.eat("%") {
                BinOp::Rem
            } else {
                return Ok(lhs);
            };
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.skip_ws();
        if self.peek() == Some('!') && self.peek_at(1) != Some('=') {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        if self.eat_word("not") {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        if self.peek() == Some('-') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            return match self.parse_number()? {
                Expr::Literal(Value::Number(n)) => Ok(Expr::Literal(negate(&n))),
                other => Ok(other),
            };
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        self.skip_ws();
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                self.expect(')')?;
                Ok(inner)
            }
            Some('"') => self.parse_double_quoted(),
            Some('\'') => self.parse_single_quoted(),
            Some(c) if c.is_ascii_digit() => self.parse_number(),
            Some('$') => Ok(Expr::Ref(self.required_reference()?)),
            Some('[') => self.parse_list(),
            Some('{') => self.parse_map(),
            Some(c) if is_ident_start(c) => {
                let word = self.identifier().unwrap_or_default();
                match word.as_str() {
                    "true" => Ok(Expr::Literal(Value::Bool(true))),
                    "false" => Ok(Expr::Literal(Value::Bool(false))),
                    "null" => Ok(Expr::Literal(Value::Null)),
                    _ => Err(self.error(format!("unexpected word '{word}' in expression"))),
                }
            }
            Some(c) => Err(self.error(format!("unexpected '{c}' in expression"))),
            None => Err(self.error("unexpected end of template in expression")),
        }
    }

    fn quoted_body(&mut self, quote: char) -> Result<String> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string literal")),
                Some(c) if c == quote => {
                    // A doubled quote is a literal quote.
                    if self.peek_at(1) == Some(quote) {
                        out.push(quote);
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                        return Ok(out);
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn parse_single_quoted(&mut self) -> Result<Expr> {
        Ok(Expr::Literal(Value::String(self.quoted_body('\'')?)))
    }

    fn parse_double_quoted(&mut self) -> Result<Expr> {
        let body = self.quoted_body('"')?;
        if !body.contains('$') && !body.contains('#') {
            return Ok(Expr::Literal(Value::String(body)));
        }
        let nodes = parse(&body)?;
        match nodes.as_slice() {
            [] => Ok(Expr::Literal(Value::String(String::new()))),
            [Node::Text(t)] => Ok(Expr::Literal(Value::String(t.clone()))),
            _ => Ok(Expr::Interpolated(nodes)),
        }
    }

    fn parse_number(&mut self) -> Result<Expr> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let is_float = self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit());
        if is_float {
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let number = if is_float {
            text.parse::<f64>().ok().and_then(Number::from_f64)
        } else {
            text.parse::<i64>().ok().map(Number::from)
        };
        number
            .map(|n| Expr::Literal(Value::Number(n)))
            .ok_or_else(|| self.error(format!("invalid number '{text}'")))
    }

    fn parse_list(&mut self) -> Result<Expr> {
        self.pos += 1;
        self.skip_ws();
        if self.eat("]") {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.parse_expr()?;
        self.skip_ws();
        if self.eat("..") {
            let last = self.parse_expr()?;
            self.expect(']')?;
            return Ok(Expr::Range(Box::new(first), Box::new(last)));
        }
        let mut items = vec![first];
        loop {
            self.skip_ws();
            if self.eat("]") {
                return Ok(Expr::List(items));
            }
            if !self.eat(",") {
                return Err(self.error("expected ',' or ']' in list"));
            }
            items.push(self.parse_expr()?);
        }
    }

    fn parse_map(&mut self) -> Result<Expr> {
        self.pos += 1;
        let mut entries = Vec::new();
        self.skip_ws();
        if self.eat("}") {
            return Ok(Expr::Map(entries));
        }
        loop {
            let key = self.parse_expr()?;
            self.expect(':')?;
            let value = self.parse_expr()?;
            entries.push((key, value));
            self.skip_ws();
            if self.eat("}") {
                return Ok(Expr::Map(entries));
            }
            if !self.eat(",") {
                return Err(self.error("expected ',' or '}' in map"));
            }
        }
    }
}

fn negate(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        return Value::Number(Number::from(-i));
    }
    n.as_f64()
        .and_then(|f| Number::from_f64(-f))
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(src: &str) -> Node {
        let mut nodes = parse(src).unwrap();
        assert_eq!(nodes.len(), 1, "{nodes:?}");
        nodes.remove(0)
    }

    #[test]
    fn parses_reference_chains() {
        let Node::Reference(r) = one("$input.params('id').length()") else {
            panic!("expected reference");
        };
        assert_eq!(r.root, "input");
        assert_eq!(r.chain.len(), 2);
        assert_eq!(r.source, "$input.params('id').length()");
        assert!(matches!(&r.chain[0], Accessor::Method(name, args) if name == "params" && args.len() == 1));
    }

    #[test]
    fn trailing_dot_is_text() {
        let nodes = parse("Hi $name.").unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[2], Node::Text(".".to_string()));
    }

    #[test]
    fn quiet_and_braced_references() {
        let Node::Reference(r) = one("$!{user.name}") else {
            panic!("expected reference");
        };
        assert!(r.quiet);
        assert_eq!(r.root, "user");
    }

    #[test]
    fn lone_dollar_and_hash_are_text() {
        assert_eq!(parse("$ 5 # x").unwrap(), vec![Node::Text("$ 5 # x".to_string())]);
        assert_eq!(parse("\\$x").unwrap(), vec![Node::Text("$x".to_string())]);
    }

    #[test]
    fn comments_are_dropped() {
        let nodes = parse("a## line\nb#* block *#c").unwrap();
        let text: String = nodes
            .iter()
            .map(|n| match n {
                Node::Text(t) => t.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(text, "abc");
    }

    #[test]
    fn break_and_stop_are_distinct() {
        assert_eq!(
            parse("a#break b#{stop}").unwrap(),
            vec![
                Node::Text("a".to_string()),
                Node::Break,
                Node::Text(" b".to_string()),
                Node::Stop,
            ]
        );
    }

    #[test]
    fn if_elseif_else_structure() {
        let Node::If {
            branches,
            otherwise,
        } = one("#if($a == 1)one#elseif($a eq 2)two#{else}other#end")
        else {
            panic!("expected #if");
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(otherwise, vec![Node::Text("other".to_string())]);
    }

    #[test]
    fn operator_precedence() {
        let Node::Set { value, .. } = one("#set($x = 1 + 2 * 3 > 6 && !false)") else {
            panic!("expected #set");
        };
        let Expr::Binary(BinOp::And, lhs, _) = value else {
            panic!("expected && at the top: {value:?}");
        };
        assert!(matches!(*lhs, Expr::Binary(BinOp::Gt, _, _)));
    }

    #[test]
    fn lists_ranges_and_maps() {
        let Node::Foreach { iterable, .. } = one("#foreach($i in [1..3])$i#end") else {
            panic!("expected #foreach");
        };
        assert!(matches!(iterable, Expr::Range(_, _)));

        let Node::Set { value, .. } = one("#set($m = {'a': [1, -2.5], \"b\": null})") else {
            panic!("expected #set");
        };
        let Expr::Map(entries) = value else {
            panic!("expected map");
        };
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn double_quoted_strings_interpolate() {
        let Node::Set { value, .. } = one("#set($s = \"id-$id\")") else {
            panic!("expected #set");
        };
        assert!(matches!(value, Expr::Interpolated(ref nodes) if nodes.len() == 2));

        let Node::Set { value, .. } = one("#set($s = \"\\\\'\")") else {
            panic!("expected #set");
        };
        assert_eq!(value, Expr::Literal(Value::String("\\\\'".to_string())));
    }

    #[test]
    fn errors_report_lines() {
        let err = parse("ok\n#if($a)\nno end").unwrap_err();
        assert!(matches!(err, RenderError::Parse { line: 3, .. }), "{err:?}");
        assert!(parse("#end").is_err());
        assert!(parse("#set($x 1)").is_err());
    }
}
