//! Canonical printing of executable documents.
//!
//! Output re-parses to the same document (modulo spans), and formatting is
//! idempotent.

use crate::ast::*;
use std::fmt::Write as _;

/// Formatting options.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Number of spaces for indentation.
    pub indent_size: usize,
    /// Use tabs instead of spaces.
    pub use_tabs: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            indent_size: 2,
            use_tabs: false,
        }
    }
}

/// Document formatter.
pub struct Formatter {
    options: FormatOptions,
    output: String,
    indent: usize,
}

impl Formatter {
    /// Creates a new formatter.
    pub fn new(options: FormatOptions) -> Self {
        Self {
            options,
            output: String::new(),
            indent: 0,
        }
    }

    /// Formats a document.
    pub fn format(&mut self, document: &Document) -> String {
        self.output.clear();
        self.indent = 0;

        for (i, def) in document.definitions.iter().enumerate() {
            if i > 0 {
                self.output.push_str("\n\n");
            }
            match def {
                Definition::Operation(o) => self.format_operation(o),
                Definition::Fragment(f) => self.format_fragment(f),
            }
        }
        self.output.push('\n');

        std::mem::take(&mut self.output)
    }

    fn format_operation(&mut self, op: &OperationDefinition) {
        let is_shorthand = op.operation == OperationType::Query
            && op.name.is_none()
            && op.variables.is_empty()
            && op.directives.is_empty();

        if !is_shorthand {
            self.output.push_str(op.operation.as_str());
            if let Some(name) = &op.name {
                self.output.push(' ');
                self.output.push_str(name.as_str());
            }
            if !op.variables.is_empty() {
                self.output.push('(');
                for (i, var) in op.variables.iter().enumerate() {
                    if i > 0 {
                        self.output.push_str(", ");
                    }
                    let _ = write!(self.output, "${}: {}", var.name, var.ty);
                    if let Some(default) = &var.default_value {
                        self.output.push_str(" = ");
                        self.format_value(default);
                    }
                    self.format_directives(&var.directives);
                }
                self.output.push(')');
            }
            self.format_directives(&op.directives);
            self.output.push(' ');
        }

        self.format_selection_set(&op.selection_set);
    }

    fn format_fragment(&mut self, fragment: &FragmentDefinition) {
        let _ = write!(
            self.output,
            "fragment {} on {}",
            fragment.name, fragment.type_condition
        );
        self.format_directives(&fragment.directives);
        self.output.push(' ');
        self.format_selection_set(&fragment.selection_set);
    }

    fn format_selection_set(&mut self, set: &SelectionSet) {
        self.output.push('{');
        self.indent += 1;
        for selection in &set.selections {
            self.output.push('\n');
            self.push_indent();
            self.format_selection(selection);
        }
        self.indent -= 1;
        self.output.push('\n');
        self.push_indent();
        self.output.push('}');
    }

    fn format_selection(&mut self, selection: &Selection) {
        match selection {
            Selection::Field(field) => {
                if let Some(alias) = &field.alias {
                    let _ = write!(self.output, "{alias}: ");
                }
                self.output.push_str(field.name.as_str());
                self.format_arguments(&field.arguments);
                self.format_directives(&field.directives);
                if let Some(set) = &field.selection_set {
                    self.output.push(' ');
                    self.format_selection_set(set);
                }
            }
            Selection::FragmentSpread(spread) => {
                let _ = write!(self.output, "...{}", spread.name);
                self.format_directives(&spread.directives);
            }
            Selection::InlineFragment(inline) => {
                self.output.push_str("...");
                if let Some(ty) = &inline.type_condition {
                    let _ = write!(self.output, " on {ty}");
                }
                self.format_directives(&inline.directives);
                self.output.push(' ');
                self.format_selection_set(&inline.selection_set);
            }
        }
    }

    fn format_arguments(&mut self, arguments: &[Argument]) {
        if arguments.is_empty() {
            return;
        }
        self.output.push('(');
        for (i, arg) in arguments.iter().enumerate() {
            if i > 0 {
                self.output.push_str(", ");
            }
            let _ = write!(self.output, "{}: ", arg.name);
            self.format_value(&arg.value);
        }
        self.output.push(')');
    }

    fn format_directives(&mut self, directives: &[Directive]) {
        for directive in directives {
            let _ = write!(self.output, " @{}", directive.name);
            self.format_arguments(&directive.arguments);
        }
    }

    fn format_value(&mut self, value: &Value) {
        match value {
            Value::Variable(name) => {
                let _ = write!(self.output, "${name}");
            }
            Value::Int(i, _) => {
                let _ = write!(self.output, "{i}");
            }
            Value::Float(f, _) => {
                let text = f.to_string();
                self.output.push_str(&text);
                if !text.contains(['.', 'e', 'E']) {
                    self.output.push_str(".0");
                }
            }
            Value::String(s, _) => self.format_string(s),
            Value::Boolean(b, _) => {
                let _ = write!(self.output, "{b}");
            }
            Value::Null(_) => self.output.push_str("null"),
            Value::Enum(name) => self.output.push_str(name.as_str()),
            Value::List(items, _) => {
                self.output.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.output.push_str(", ");
                    }
                    self.format_value(item);
                }
                self.output.push(']');
            }
            Value::Object(fields, _) => {
                self.output.push('{');
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        self.output.push_str(", ");
                    }
                    let _ = write!(self.output, "{name}: ");
                    self.format_value(value);
                }
                self.output.push('}');
            }
        }
    }

    fn format_string(&mut self, s: &str) {
        self.output.push('"');
        for c in s.chars() {
            match c {
                '"' => self.output.push_str("\\\""),
                '\\' => self.output.push_str("\\\\"),
                '\n' => self.output.push_str("\\n"),
                '\r' => self.output.push_str("\\r"),
                '\t' => self.output.push_str("\\t"),
                '\u{8}' => self.output.push_str("\\b"),
                '\u{c}' => self.output.push_str("\\f"),
                c if c.is_control() => {
                    let _ = write!(self.output, "\\u{:04X}", c as u32);
                }
                c => self.output.push(c),
            }
        }
        self.output.push('"');
    }

    fn push_indent(&mut self) {
        if self.options.use_tabs {
            for _ in 0..self.indent {
                self.output.push('\t');
            }
        } else {
            for _ in 0..self.indent * self.options.indent_size {
                self.output.push(' ');
            }
        }
    }
}

/// Formats a document with default options.
pub fn format(document: &Document) -> String {
    format_with_options(document, FormatOptions::default())
}

/// Formats a document with custom options.
pub fn format_with_options(document: &Document, options: FormatOptions) -> String {
    Formatter::new(options).format(document)
}
