//! Syntax layer for quill.
//!
//! This crate provides:
//! - `token`: Token kinds and token structures
//! - `lexer`: Tokenization
//! - `ast`: Abstract syntax tree types for executable documents
//! - `parser`: Recursive descent parser
//! - `formatter`: Canonical printing

pub mod ast;
pub mod formatter;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::*;
pub use formatter::{format, format_with_options, FormatOptions, Formatter};
pub use lexer::Lexer;
pub use parser::{parse, ParseResult, MAX_DEPTH};
pub use token::{Token, TokenKind};
