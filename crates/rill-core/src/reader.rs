//! Source → AST: tokenizer, config-directive extractor and the
//! recursive-descent parser for the prefix rule language.
//!
//! Recognition is a deterministic first-match over an ordered matcher
//! list (paren → integer → string → identifier → comment); every
//! failure carries a character offset rendered into the error's source
//! window.

use crate::engine::Engine;
use crate::program::{CompileError, CompileOptions};
use crate::runtime::{builtin_constant, OpEntry, Operators, SelectorKey};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    LParen,
    RParen,
    Int,
    Str,
    Ident,
    Comment,
}

impl TokenKind {
    fn tag(self) -> &'static str {
        match self {
            TokenKind::LParen => "lparen",
            TokenKind::RParen => "rparen",
            TokenKind::Int => "integer",
            TokenKind::Str => "string",
            TokenKind::Ident => "identifier",
            TokenKind::Comment => "comment",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) text: String,
    pub(crate) pos: usize,
}

/// Parsed expression tree. The conditional keeps exactly its three
/// source children; the synthetic branch head and join marker
/// materialize during lowering.
#[derive(Debug, Clone)]
pub(crate) enum AstExpr {
    Constant(Value),
    Selector { name: String, key: SelectorKey },
    Operator {
        name: String,
        entry: OpEntry,
        children: Vec<AstExpr>,
    },
    Cond { children: Vec<AstExpr> },
}

const KEYWORD_IF: &str = "if";
const RESERVED_KEYWORDS: [&str; 8] = [
    KEYWORD_IF, "let", "any", "all", "map", "filter", "reduce", "collect",
];

const CONFIG_PREFIX: &str = ";;;;";

/// Parse a source string against the engine's registries. Returns the
/// AST and the compile options after directive overrides.
pub(crate) fn parse(
    engine: &Engine,
    source: &str,
) -> Result<(AstExpr, CompileOptions), CompileError> {
    let mut parser = Parser {
        source: source.chars().collect(),
        engine,
        options: engine.options(),
        tokens: Vec::new(),
        idx: 0,
    };
    parser.lex()?;
    parser.extract_config()?;
    parser.tokens.retain(|t| t.kind != TokenKind::Comment);
    parser.check_parentheses()?;
    let ast = parser.parse_expression()?;
    if parser.idx != parser.tokens.len() {
        let pos = parser.tokens[parser.idx].pos;
        return Err(parser.err_at("RILL_E_TOKEN", "invalid expression", pos));
    }
    Ok((ast, parser.options))
}

struct Parser<'a> {
    source: Vec<char>,
    engine: &'a Engine,
    options: CompileOptions,
    tokens: Vec<Token>,
    idx: usize,
}

// ─── lexer ───────────────────────────────────────────────────────────────────

/// Word boundary characters besides whitespace.
fn is_delimiter(c: char) -> bool {
    matches!(c, '(' | ')' | '[' | ']' | ';')
}

/// Scan a whitespace/delimiter-bounded word starting at `i`.
fn next_word(source: &[char], i: usize) -> (String, usize) {
    let mut j = i;
    while j < source.len() && !source[j].is_whitespace() && !is_delimiter(source[j]) {
        j += 1;
    }
    (source[i..j].iter().collect(), j)
}

fn lex_paren(source: &[char], i: usize) -> Option<(Token, usize)> {
    const PARENS: &str = "()[]";
    let idx = PARENS.find(source[i])?;
    let kind = if idx % 2 == 0 {
        TokenKind::LParen
    } else {
        TokenKind::RParen
    };
    Some((
        Token {
            kind,
            text: source[i].to_string(),
            pos: i,
        },
        i + 1,
    ))
}

fn lex_int(source: &[char], i: usize) -> Option<(Token, usize)> {
    let (word, j) = next_word(source, i);
    if word.parse::<i64>().is_err() {
        return None;
    }
    Some((
        Token {
            kind: TokenKind::Int,
            text: word,
            pos: i,
        },
        j,
    ))
}

fn lex_ident(source: &[char], i: usize, ops: &Operators) -> Option<(Token, usize)> {
    let (word, j) = next_word(source, i);
    if word.is_empty() {
        return None;
    }
    for (idx, c) in word.chars().enumerate() {
        if c.is_alphabetic() || c == '_' || (c.is_ascii_digit() && idx != 0) {
            continue;
        }
        // Words with other characters are identifiers only when they
        // name a registered operator (`+`, `<=`, ...).
        if ops.contains(&word) {
            break;
        }
        return None;
    }
    Some((
        Token {
            kind: TokenKind::Ident,
            text: word,
            pos: i,
        },
        j,
    ))
}

fn lex_comment(source: &[char], i: usize) -> Option<(Token, usize)> {
    if source[i] != ';' {
        return None;
    }
    let mut j = i;
    while j < source.len() && source[j] != '\n' {
        j += 1;
    }
    Some((
        Token {
            kind: TokenKind::Comment,
            text: source[i..j].iter().collect(),
            pos: i,
        },
        j,
    ))
}

impl Parser<'_> {
    fn lex(&mut self) -> Result<(), CompileError> {
        let ops = self.engine.operators();
        let mut tokens = Vec::new();
        let mut i = 0;
        while i < self.source.len() {
            if self.source[i].is_whitespace() {
                i += 1;
                continue;
            }
            if self.source[i] == '"' {
                let (token, j) = self.lex_str(i)?;
                tokens.push(token);
                i = j;
                continue;
            }
            let matched = lex_paren(&self.source, i)
                .or_else(|| lex_int(&self.source, i))
                .or_else(|| lex_ident(&self.source, i, ops))
                .or_else(|| lex_comment(&self.source, i));
            match matched {
                Some((token, j)) => {
                    tokens.push(token);
                    i = j;
                }
                None => {
                    return Err(self.err_at("RILL_E_LEX", "cannot lex token", i));
                }
            }
        }
        self.tokens = tokens;
        Ok(())
    }

    /// Double-quoted, terminated by the next quote, no escapes.
    fn lex_str(&self, i: usize) -> Result<(Token, usize), CompileError> {
        let mut j = i + 1;
        while j < self.source.len() {
            if self.source[j] == '"' {
                return Ok((
                    Token {
                        kind: TokenKind::Str,
                        text: self.source[i + 1..j].iter().collect(),
                        pos: i,
                    },
                    j + 1,
                ));
            }
            j += 1;
        }
        Err(self.err_at("RILL_E_LEX", "unterminated string", i))
    }

    // ─── config extractor ────────────────────────────────────────────────────

    /// Scan the leading comment run for `;;;;` directives and apply
    /// them to a copy of the engine options.
    fn extract_config(&mut self) -> Result<(), CompileError> {
        let mut options = self.options;
        for token in &self.tokens {
            if token.kind != TokenKind::Comment {
                break;
            }
            let body = token.text.trim();
            let Some(body) = body.strip_prefix(CONFIG_PREFIX) else {
                continue;
            };
            for fragment in body.split(',') {
                let mut parts = fragment.splitn(2, ':');
                let (name, value) = match (parts.next(), parts.next()) {
                    (Some(name), Some(value)) => (name.trim(), value.trim()),
                    _ => {
                        return Err(CompileError::new(
                            "RILL_E_CONFIG",
                            format!("invalid config fragment [{}]", fragment.trim()),
                        )
                        .at(&self.source, token.pos));
                    }
                };
                let enabled = value.parse::<bool>().map_err(|_| {
                    CompileError::new(
                        "RILL_E_CONFIG",
                        format!("config value for [{name}] must be a boolean, got [{value}]"),
                    )
                    .at(&self.source, token.pos)
                })?;
                match name {
                    "optimize" => options.set_all_optimizations(enabled),
                    "reordering" => options.reordering = enabled,
                    "fast_evaluation" => options.fast_evaluation = enabled,
                    "constant_folding" => options.constant_folding = enabled,
                    _ => {
                        return Err(CompileError::new(
                            "RILL_E_CONFIG",
                            format!("unsupported config option [{name}]"),
                        )
                        .at(&self.source, token.pos));
                    }
                }
            }
        }
        self.options = options;
        Ok(())
    }

    // ─── parser ──────────────────────────────────────────────────────────────

    fn check_parentheses(&self) -> Result<(), CompileError> {
        let Some(first) = self.tokens.first() else {
            return Err(CompileError::new("RILL_E_TOKEN", "empty expression"));
        };
        let last = self.tokens.len() - 1;
        if first.kind != TokenKind::LParen || self.tokens[last].kind != TokenKind::RParen {
            return Err(self.paren_err(first.pos));
        }
        let mut depth = 0i32;
        for (i, token) in self.tokens.iter().enumerate() {
            match token.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => depth -= 1,
                _ => {}
            }
            if depth < 0 || (depth == 0 && i != last) {
                return Err(self.paren_err(token.pos));
            }
        }
        if depth != 0 {
            return Err(self.paren_err(self.tokens[last].pos));
        }
        Ok(())
    }

    fn peek(&self) -> Result<&Token, CompileError> {
        self.tokens.get(self.idx).ok_or_else(|| {
            CompileError::new("RILL_E_TOKEN", "unexpected end of expression")
        })
    }

    fn next(&mut self) -> Result<Token, CompileError> {
        let token = self.peek()?.clone();
        self.idx += 1;
        Ok(token)
    }

    fn parse_expression(&mut self) -> Result<AstExpr, CompileError> {
        if let Some(ast) = self.parse_single()? {
            return Ok(ast);
        }

        let head = self.peek()?.clone();
        if head.kind == TokenKind::Ident {
            return Err(self.unknown_ident(&head));
        }
        if head.kind != TokenKind::LParen {
            return Err(self.token_type_error(TokenKind::LParen, &head));
        }
        self.idx += 1;

        let car = self.next()?;
        if car.kind != TokenKind::Ident {
            return Err(self.token_type_error(TokenKind::Ident, &car));
        }

        let mut children = Vec::new();
        while self.peek()?.kind != TokenKind::RParen {
            children.push(self.parse_expression()?);
        }
        self.idx += 1;

        self.build_node(&car, children)
    }

    /// Atoms, tried in order: integer, string, named constant,
    /// selector, list literal.
    fn parse_single(&mut self) -> Result<Option<AstExpr>, CompileError> {
        if let Some(ast) = self.parse_int()? {
            return Ok(Some(ast));
        }
        if let Some(ast) = self.parse_str()? {
            return Ok(Some(ast));
        }
        if let Some(ast) = self.parse_const()? {
            return Ok(Some(ast));
        }
        if let Some(ast) = self.parse_selector()? {
            return Ok(Some(ast));
        }
        self.parse_list()
    }

    fn parse_int(&mut self) -> Result<Option<AstExpr>, CompileError> {
        let token = self.peek()?;
        if token.kind != TokenKind::Int {
            return Ok(None);
        }
        let pos = token.pos;
        let n = token
            .text
            .parse::<i64>()
            .map_err(|_| self.err_at("RILL_E_INTERNAL", "lexed integer out of range", pos))?;
        self.idx += 1;
        Ok(Some(AstExpr::Constant(Value::Int(n))))
    }

    fn parse_str(&mut self) -> Result<Option<AstExpr>, CompileError> {
        let token = self.peek()?;
        if token.kind != TokenKind::Str {
            return Ok(None);
        }
        let value = Value::from(token.text.as_str());
        self.idx += 1;
        Ok(Some(AstExpr::Constant(value)))
    }

    fn parse_const(&mut self) -> Result<Option<AstExpr>, CompileError> {
        let token = self.peek()?;
        if token.kind != TokenKind::Ident {
            return Ok(None);
        }
        let value = builtin_constant(&token.text).or_else(|| self.engine.constant(&token.text));
        let Some(value) = value else {
            return Ok(None);
        };
        self.idx += 1;
        Ok(Some(AstExpr::Constant(value)))
    }

    fn parse_selector(&mut self) -> Result<Option<AstExpr>, CompileError> {
        let token = self.peek()?;
        if token.kind != TokenKind::Ident {
            return Ok(None);
        }
        let key = match self.engine.selector_key(&token.text) {
            Some(key) => key,
            None if self.options.allow_unknown_selectors => SelectorKey::UNDEFINED,
            None => return Ok(None),
        };
        let name = token.text.clone();
        self.idx += 1;
        Ok(Some(AstExpr::Selector { name, key }))
    }

    /// A list literal is an opening paren immediately followed by a
    /// closing paren, an integer or a string; every element must share
    /// that token kind. Empty lists are rejected (their element type
    /// would be ambiguous).
    fn parse_list(&mut self) -> Result<Option<AstExpr>, CompileError> {
        let open = self.peek()?.clone();
        if open.kind != TokenKind::LParen {
            return Ok(None);
        }
        let Some(second) = self.tokens.get(self.idx + 1) else {
            return Ok(None);
        };
        let elem_kind = second.kind;
        if !matches!(elem_kind, TokenKind::RParen | TokenKind::Int | TokenKind::Str) {
            return Ok(None);
        }
        if elem_kind == TokenKind::RParen {
            return Err(self.err_at("RILL_E_LIST", "empty list literal", open.pos));
        }

        let mut texts = Vec::new();
        let mut j = self.idx + 1;
        loop {
            let Some(token) = self.tokens.get(j) else {
                return Err(self.paren_err(open.pos));
            };
            if token.kind == TokenKind::RParen {
                break;
            }
            if token.kind != elem_kind {
                return Err(self.token_type_error(elem_kind, &token.clone()));
            }
            texts.push(token.text.clone());
            j += 1;
        }

        let value = if elem_kind == TokenKind::Int {
            let mut items = Vec::with_capacity(texts.len());
            for (text, token) in texts.iter().zip(&self.tokens[self.idx + 1..]) {
                let n = text.parse::<i64>().map_err(|_| {
                    self.err_at("RILL_E_INTERNAL", "lexed integer out of range", token.pos)
                })?;
                items.push(n);
            }
            Value::from(items)
        } else {
            Value::from(texts)
        };
        self.idx = j + 1;
        Ok(Some(AstExpr::Constant(value)))
    }

    fn build_node(&self, car: &Token, children: Vec<AstExpr>) -> Result<AstExpr, CompileError> {
        if RESERVED_KEYWORDS.contains(&car.text.as_str()) {
            return self.build_keyword_node(car, children);
        }

        let Some(entry) = self.engine.operators().get(&car.text) else {
            return Err(self.unknown_ident(car));
        };
        Ok(AstExpr::Operator {
            name: car.text.clone(),
            entry: *entry,
            children,
        })
    }

    fn build_keyword_node(
        &self,
        car: &Token,
        children: Vec<AstExpr>,
    ) -> Result<AstExpr, CompileError> {
        if car.text != KEYWORD_IF {
            return Err(self.err_at(
                "RILL_E_KEYWORD",
                format!("[{}] is not currently supported", car.text),
                car.pos,
            ));
        }
        if children.len() != 3 {
            return Err(self.err_at(
                "RILL_E_ARITY",
                format!("if expects 3 arguments, got {}", children.len()),
                car.pos,
            ));
        }
        Ok(AstExpr::Cond { children })
    }

    // ─── errors ──────────────────────────────────────────────────────────────

    fn err_at(
        &self,
        code: &str,
        message: impl Into<String>,
        pos: usize,
    ) -> CompileError {
        CompileError::new(code, message).at(&self.source, pos)
    }

    fn paren_err(&self, pos: usize) -> CompileError {
        self.err_at("RILL_E_PAREN", "parentheses unmatched", pos)
    }

    fn token_type_error(&self, want: TokenKind, got: &Token) -> CompileError {
        self.err_at(
            "RILL_E_TOKEN",
            format!(
                "unexpected token (want: {}, got: {})",
                want.tag(),
                got.kind.tag()
            ),
            got.pos,
        )
    }

    fn unknown_ident(&self, token: &Token) -> CompileError {
        self.err_at(
            "RILL_E_UNKNOWN",
            format!("unknown identifier [{}]", token.text),
            token.pos,
        )
    }
}
