//! Source command lines.
//!
//! A spawn request arrives as a shell-style line: a program name, optional
//! whitespace-separated arguments, and an optional trailing `&` that asks for
//! a background process.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// A parsed spawn line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceCommand {
    /// Program name (first token).
    pub name: String,
    /// Remaining tokens, minus any trailing `&`.
    pub args: Vec<String>,
    /// Whether the line ended in `&`.
    pub background: bool,
}

impl SourceCommand {
    /// Build a command directly, without going through a line.
    pub fn new(name: &str, args: &[&str], background: bool) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            background,
        }
    }

    /// Parse a command line. Returns `None` for blank input.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens: Vec<&str> = line.split_whitespace().collect();
        let background = tokens.last() == Some(&"&");
        if background {
            tokens.pop();
        }
        let name = tokens.first()?.to_string();
        let args = tokens[1..].iter().map(|t| t.to_string()).collect();
        Some(Self { name, args, background })
    }

    /// The canonical line this command round-trips to.
    pub fn line(&self) -> String {
        let mut out = self.name.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        if self.background {
            out.push_str(" &");
        }
        out
    }
}

impl core::fmt::Display for SourceCommand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.line())
    }
}
