//! Core utilities for quill.
//!
//! This crate provides foundational types used throughout quill:
//! - `span`: Source location tracking and line/column lookup
//! - `diagnostics`: Error reporting

pub mod diagnostics;
pub mod span;

pub use diagnostics::{Diagnostic, DiagnosticBag, DiagnosticSeverity, Label};
pub use span::{LineIndex, Location, Span};
