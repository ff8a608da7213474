//! Recursive descent parser for GraphQL executable documents.

use crate::ast::*;
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};
use quill_core::{diagnostics::codes, DiagnosticBag, Span};

/// Deepest nesting of selection sets, list and object values, and list types.
pub const MAX_DEPTH: usize = 256;

/// Parser for executable documents.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    /// End of the previously consumed token.
    prev_end: u32,
    depth: usize,
    too_deep: bool,
    diagnostics: DiagnosticBag,
}

/// Result of parsing.
#[derive(Debug)]
pub struct ParseResult {
    pub document: Document,
    pub diagnostics: DiagnosticBag,
}

impl ParseResult {
    /// Returns the document, or every diagnostic if any of them is an error.
    pub fn into_result(self) -> Result<Document, DiagnosticBag> {
        if self.diagnostics.has_errors() {
            Err(self.diagnostics)
        } else {
            Ok(self.document)
        }
    }
}

/// Parses a source string into a document.
pub fn parse(source: &str) -> ParseResult {
    let mut parser = Parser::new(source);
    let document = parser.parse_document();
    ParseResult {
        document,
        diagnostics: parser.diagnostics,
    }
}

impl<'a> Parser<'a> {
    /// Creates a new parser.
    pub fn new(source: &'a str) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.next_token();
        Self {
            lexer,
            current,
            prev_end: 0,
            depth: 0,
            too_deep: false,
            diagnostics: DiagnosticBag::new(),
        }
    }

    #[inline]
    fn at(&self) -> TokenKind {
        self.current.kind
    }

    #[inline]
    fn at_kind(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn advance(&mut self) {
        self.prev_end = self.current.span.end;
        self.current = self.lexer.next_token();
    }

    fn expect(&mut self, kind: TokenKind) -> bool {
        if self.at_kind(kind) {
            self.advance();
            true
        } else {
            self.error_expected(kind);
            false
        }
    }

    fn current_text(&self) -> &'a str {
        self.lexer.span_text(self.current.span)
    }

    fn span_from(&self, start: u32) -> Span {
        Span::new(start, self.prev_end.max(start))
    }

    fn error(&mut self, message: &str) {
        let code = if self.at_kind(TokenKind::Eof) {
            codes::UNEXPECTED_EOF
        } else {
            codes::INVALID_SYNTAX
        };
        self.diagnostics
            .error(code, message, self.current.span, message.to_string());
    }

    fn error_expected(&mut self, expected: TokenKind) {
        let code = if self.at_kind(TokenKind::Eof) {
            codes::UNEXPECTED_EOF
        } else {
            codes::UNEXPECTED_TOKEN
        };
        self.diagnostics.error(
            code,
            format!("expected {}, found {}", expected, self.at()),
            self.current.span,
            format!("expected {expected}"),
        );
    }

    /// Enters the nested construct opened by the current token. Past
    /// [`MAX_DEPTH`] the whole construct is skipped instead and `false` is
    /// returned; callers that get `true` must call [`Self::ascend`].
    fn descend(&mut self) -> bool {
        if self.depth < MAX_DEPTH {
            self.depth += 1;
            return true;
        }
        if !self.too_deep {
            self.too_deep = true;
            self.diagnostics.error(
                codes::NESTING_TOO_DEEP,
                "document nesting too deep",
                self.current.span,
                format!("nesting is limited to {MAX_DEPTH} levels"),
            );
        }
        self.skip_nested();
        false
    }

    fn ascend(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Skips a bracketed construct without recursing.
    fn skip_nested(&mut self) {
        let mut open = 0usize;
        loop {
            match self.at() {
                TokenKind::Eof => return,
                TokenKind::LBrace | TokenKind::LBracket | TokenKind::LParen => open += 1,
                TokenKind::RBrace | TokenKind::RBracket | TokenKind::RParen => {
                    open = open.saturating_sub(1);
                }
                _ => {}
            }
            self.advance();
            if open == 0 {
                return;
            }
        }
    }

    /// Skips the current token if a list item made no progress.
    fn ensure_progress(&mut self, before: u32) {
        if self.current.span.start == before && !self.at_kind(TokenKind::Eof) {
            self.advance();
        }
    }

    /// Parses a document.
    pub fn parse_document(&mut self) -> Document {
        let start = self.current.span.start;
        let mut definitions = Vec::new();

        if self.at_kind(TokenKind::Eof) {
            self.error("expected at least one definition");
        }

        while !self.at_kind(TokenKind::Eof) {
            if let Some(def) = self.parse_definition() {
                definitions.push(def);
            } else {
                self.recover_to_definition();
            }
        }

        Document {
            definitions,
            span: Span::new(start, self.current.span.end),
        }
    }

    fn parse_definition(&mut self) -> Option<Definition> {
        match self.at() {
            TokenKind::LBrace | TokenKind::Query | TokenKind::Mutation | TokenKind::Subscription => {
                Some(Definition::Operation(self.parse_operation()))
            }
            TokenKind::Fragment => Some(Definition::Fragment(self.parse_fragment_definition())),
            TokenKind::StringLiteral | TokenKind::BlockStringLiteral => {
                self.error("descriptions are not allowed on executable definitions");
                None
            }
            _ => {
                self.error("expected an operation or fragment definition");
                None
            }
        }
    }

    /// Skips tokens until something that can start a definition.
    fn recover_to_definition(&mut self) {
        self.advance();
        let mut depth = 0usize;
        loop {
            match self.at() {
                TokenKind::Eof => break,
                TokenKind::LBrace if depth == 0 => break,
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => depth = depth.saturating_sub(1),
                TokenKind::Query
                | TokenKind::Mutation
                | TokenKind::Subscription
                | TokenKind::Fragment
                    if depth == 0 =>
                {
                    break
                }
                _ => {}
            }
            self.advance();
        }
    }

    /// Parses a name. Keywords are valid names.
    fn parse_name(&mut self) -> Name {
        let span = self.current.span;
        if self.at_kind(TokenKind::Ident) || self.at().is_keyword() {
            let value = self.current_text().to_string();
            self.advance();
            Name::new(value, span)
        } else {
            self.error("expected name");
            Name::new(String::new(), span)
        }
    }

    fn parse_operation(&mut self) -> OperationDefinition {
        let start = self.current.span.start;

        if self.at_kind(TokenKind::LBrace) {
            let selection_set = self.parse_selection_set();
            return OperationDefinition {
                operation: OperationType::Query,
                name: None,
                variables: Vec::new(),
                directives: Vec::new(),
                selection_set,
                span: self.span_from(start),
            };
        }

        let operation = match self.at() {
            TokenKind::Mutation => OperationType::Mutation,
            TokenKind::Subscription => OperationType::Subscription,
            _ => OperationType::Query,
        };
        self.advance();

        let name = if self.at_kind(TokenKind::Ident) || self.at().is_keyword() {
            Some(self.parse_name())
        } else {
            None
        };

        let variables = if self.at_kind(TokenKind::LParen) {
            self.advance();
            let vars = self.parse_variable_definitions();
            self.expect(TokenKind::RParen);
            vars
        } else {
            Vec::new()
        };

        let directives = self.parse_directives(false);
        let selection_set = self.parse_selection_set();

        OperationDefinition {
            operation,
            name,
            variables,
            directives,
            selection_set,
            span: self.span_from(start),
        }
    }

    fn parse_variable_definitions(&mut self) -> Vec<VariableDefinition> {
        let mut vars = Vec::new();
        while !self.at_kind(TokenKind::RParen) && !self.at_kind(TokenKind::Eof) {
            let before = self.current.span.start;
            vars.push(self.parse_variable_definition());
            self.ensure_progress(before);
        }
        if vars.is_empty() {
            self.error("expected at least one variable definition");
        }
        vars
    }

    fn parse_variable_definition(&mut self) -> VariableDefinition {
        let start = self.current.span.start;
        self.expect(TokenKind::Dollar);
        let name = self.parse_name();
        self.expect(TokenKind::Colon);
        let ty = self.parse_type();

        let default_value = if self.at_kind(TokenKind::Eq) {
            self.advance();
            Some(self.parse_value(true))
        } else {
            None
        };

        let directives = self.parse_directives(true);

        VariableDefinition {
            name,
            ty,
            default_value,
            directives,
            span: self.span_from(start),
        }
    }

    /// Parses a type reference: `Name`, `[Type]`, or either followed by `!`.
    fn parse_type(&mut self) -> Type {
        let start = self.current.span.start;

        let ty = if self.at_kind(TokenKind::LBracket) {
            if !self.descend() {
                return Type::Named(Name::new(String::new(), self.span_from(start)));
            }
            self.advance();
            let inner = self.parse_type();
            self.expect(TokenKind::RBracket);
            self.ascend();
            Type::List(Box::new(inner), self.span_from(start))
        } else {
            Type::Named(self.parse_name())
        };

        if self.at_kind(TokenKind::Bang) {
            self.advance();
            Type::NonNull(Box::new(ty), self.span_from(start))
        } else {
            ty
        }
    }

    fn parse_directives(&mut self, is_const: bool) -> Vec<Directive> {
        let mut directives = Vec::new();
        while self.at_kind(TokenKind::At) {
            directives.push(self.parse_directive(is_const));
        }
        directives
    }

    fn parse_directive(&mut self, is_const: bool) -> Directive {
        let start = self.current.span.start;
        self.advance(); // @

        let name = self.parse_name();
        let arguments = self.parse_arguments(is_const);

        Directive {
            name,
            arguments,
            span: self.span_from(start),
        }
    }

    fn parse_arguments(&mut self, is_const: bool) -> Vec<Argument> {
        if !self.at_kind(TokenKind::LParen) {
            return Vec::new();
        }
        self.advance();

        let mut args = Vec::new();
        while !self.at_kind(TokenKind::RParen) && !self.at_kind(TokenKind::Eof) {
            let before = self.current.span.start;
            args.push(self.parse_argument(is_const));
            self.ensure_progress(before);
        }
        if args.is_empty() {
            self.error("expected at least one argument");
        }
        self.expect(TokenKind::RParen);
        args
    }

    fn parse_argument(&mut self, is_const: bool) -> Argument {
        let start = self.current.span.start;
        let name = self.parse_name();
        self.expect(TokenKind::Colon);
        let value = self.parse_value(is_const);
        Argument {
            name,
            value,
            span: self.span_from(start),
        }
    }

    /// Parses a value. Variables are rejected when `is_const` is set.
    fn parse_value(&mut self, is_const: bool) -> Value {
        let start = self.current.span.start;

        match self.at() {
            TokenKind::Dollar => {
                if is_const {
                    self.error("variables are not allowed in constant values");
                }
                self.advance();
                let mut name = self.parse_name();
                name.span = self.span_from(start);
                Value::Variable(name)
            }
            TokenKind::IntLiteral => {
                let text = self.current_text();
                let value = if let Ok(value) = text.parse() {
                    value
                } else {
                    self.diagnostics.error(
                        codes::INVALID_NUMBER,
                        "integer literal out of range",
                        self.current.span,
                        format!("{text} does not fit in 64 bits"),
                    );
                    0
                };
                self.advance();
                Value::Int(value, self.span_from(start))
            }
            TokenKind::FloatLiteral => {
                let value = self.current_text().parse().unwrap_or(0.0);
                self.advance();
                Value::Float(value, self.span_from(start))
            }
            TokenKind::StringLiteral => {
                let text = self.current_text();
                let value = match unescape_string(&text[1..text.len() - 1]) {
                    Ok(value) => value,
                    Err(message) => {
                        self.diagnostics.error(
                            codes::INVALID_STRING,
                            "invalid string literal",
                            self.current.span,
                            message,
                        );
                        String::new()
                    }
                };
                self.advance();
                Value::String(value, self.span_from(start))
            }
            TokenKind::BlockStringLiteral => {
                let text = self.current_text();
                let value = block_string_value(&text[3..text.len() - 3]);
                self.advance();
                Value::String(value, self.span_from(start))
            }
            TokenKind::True => {
                self.advance();
                Value::Boolean(true, self.span_from(start))
            }
            TokenKind::False => {
                self.advance();
                Value::Boolean(false, self.span_from(start))
            }
            TokenKind::Null => {
                self.advance();
                Value::Null(self.span_from(start))
            }
            TokenKind::LBracket => {
                if !self.descend() {
                    return Value::Null(self.span_from(start));
                }
                self.advance();
                let mut values = Vec::new();
                while !self.at_kind(TokenKind::RBracket) && !self.at_kind(TokenKind::Eof) {
                    let before = self.current.span.start;
                    values.push(self.parse_value(is_const));
                    self.ensure_progress(before);
                }
                self.expect(TokenKind::RBracket);
                self.ascend();
                Value::List(values, self.span_from(start))
            }
            TokenKind::LBrace => {
                if !self.descend() {
                    return Value::Null(self.span_from(start));
                }
                self.advance();
                let mut fields = Vec::new();
                while !self.at_kind(TokenKind::RBrace) && !self.at_kind(TokenKind::Eof) {
                    let before = self.current.span.start;
                    let name = self.parse_name();
                    self.expect(TokenKind::Colon);
                    let value = self.parse_value(is_const);
                    fields.push((name, value));
                    self.ensure_progress(before);
                }
                self.expect(TokenKind::RBrace);
                self.ascend();
                Value::Object(fields, self.span_from(start))
            }
            TokenKind::Ident | TokenKind::Query | TokenKind::Mutation
            | TokenKind::Subscription | TokenKind::Fragment | TokenKind::On => {
                Value::Enum(self.parse_name())
            }
            _ => {
                self.error("expected value");
                if !self.at_kind(TokenKind::Eof) {
                    self.advance();
                }
                Value::Null(self.span_from(start))
            }
        }
    }

    fn parse_fragment_definition(&mut self) -> FragmentDefinition {
        let start = self.current.span.start;
        self.advance(); // fragment

        let name = self.parse_name();
        if name.value == "on" {
            self.diagnostics.error(
                codes::INVALID_SYNTAX,
                "fragment cannot be named `on`",
                name.span,
                "rename this fragment",
            );
        }
        self.expect(TokenKind::On);
        let type_condition = self.parse_name();
        let directives = self.parse_directives(false);
        let selection_set = self.parse_selection_set();

        FragmentDefinition {
            name,
            type_condition,
            directives,
            selection_set,
            span: self.span_from(start),
        }
    }

    fn parse_selection_set(&mut self) -> SelectionSet {
        let start = self.current.span.start;
        if self.at_kind(TokenKind::LBrace) && !self.descend() {
            return SelectionSet {
                selections: Vec::new(),
                span: self.span_from(start),
            };
        }
        if !self.expect(TokenKind::LBrace) {
            return SelectionSet {
                selections: Vec::new(),
                span: Span::empty(start),
            };
        }

        let mut selections = Vec::new();
        while !self.at_kind(TokenKind::RBrace) && !self.at_kind(TokenKind::Eof) {
            let before = self.current.span.start;
            selections.push(self.parse_selection());
            self.ensure_progress(before);
        }
        if selections.is_empty() {
            self.error("expected at least one selection");
        }
        self.expect(TokenKind::RBrace);
        self.ascend();

        SelectionSet {
            selections,
            span: self.span_from(start),
        }
    }

    fn parse_selection(&mut self) -> Selection {
        if !self.at_kind(TokenKind::Spread) {
            return Selection::Field(self.parse_field_selection());
        }

        let start = self.current.span.start;
        self.advance(); // ...

        if self.at_kind(TokenKind::On) {
            self.advance();
            let type_condition = Some(self.parse_name());
            let directives = self.parse_directives(false);
            let selection_set = self.parse_selection_set();
            Selection::InlineFragment(InlineFragment {
                type_condition,
                directives,
                selection_set,
                span: self.span_from(start),
            })
        } else if self.at_kind(TokenKind::LBrace) || self.at_kind(TokenKind::At) {
            let directives = self.parse_directives(false);
            let selection_set = self.parse_selection_set();
            Selection::InlineFragment(InlineFragment {
                type_condition: None,
                directives,
                selection_set,
                span: self.span_from(start),
            })
        } else {
            let name = self.parse_name();
            let directives = self.parse_directives(false);
            Selection::FragmentSpread(FragmentSpread {
                name,
                directives,
                span: self.span_from(start),
            })
        }
    }

    fn parse_field_selection(&mut self) -> FieldSelection {
        let start = self.current.span.start;

        let first_name = self.parse_name();
        let (alias, name) = if self.at_kind(TokenKind::Colon) {
            self.advance();
            (Some(first_name), self.parse_name())
        } else {
            (None, first_name)
        };

        let arguments = self.parse_arguments(false);
        let directives = self.parse_directives(false);

        let selection_set = if self.at_kind(TokenKind::LBrace) {
            Some(self.parse_selection_set())
        } else {
            None
        };

        FieldSelection {
            alias,
            name,
            arguments,
            directives,
            selection_set,
            span: self.span_from(start),
        }
    }
}

/// Decodes the escape sequences of a quoted string body.
fn unescape_string(raw: &str) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == 4)
                    .ok_or_else(|| format!("invalid unicode escape \\u{hex}"))?;
                let c = char::from_u32(code)
                    .ok_or_else(|| format!("\\u{hex} is not a valid character"))?;
                out.push(c);
            }
            Some(other) => return Err(format!("invalid escape sequence \\{other}")),
            None => return Err("unterminated escape sequence".to_string()),
        }
    }
    Ok(out)
}

/// Computes the value of a block string body: common indentation is removed
/// and leading/trailing blank lines are dropped.
fn block_string_value(raw: &str) -> String {
    let raw = raw.replace("\\\"\"\"", "\"\"\"");
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = normalized.split('\n').collect();

    let indent_of = |line: &str| line.len() - line.trim_start_matches([' ', '\t']).len();
    let is_blank = |line: &str| line.trim_matches([' ', '\t']).is_empty();

    let common_indent = lines
        .iter()
        .skip(1)
        .filter(|line| !is_blank(line))
        .map(|line| indent_of(line))
        .min()
        .unwrap_or(0);

    let mut dedented: Vec<&str> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            if i == 0 {
                *line
            } else if line.len() < common_indent {
                line.trim_start_matches([' ', '\t'])
            } else {
                &line[common_indent..]
            }
        })
        .collect();

    while dedented.first().is_some_and(|l| is_blank(l)) {
        dedented.remove(0);
    }
    while dedented.last().is_some_and(|l| is_blank(l)) {
        dedented.pop();
    }

    dedented.join("\n")
}
