use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ExtractError;

/// Source text keyed by its `/`-separated path relative to the walked root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub text: String,
}

impl SourceFile {
    #[must_use]
    pub fn new(path: &str, text: &str) -> Self {
        Self {
            path: path.to_string(),
            text: text.to_string(),
        }
    }
}

fn read_dir_entries(path: &Path) -> Result<Vec<PathBuf>, ExtractError> {
    let entries = fs::read_dir(path).map_err(|err| ExtractError::io(path, &err))?;
    Ok(entries.filter_map(Result::ok).map(|e| e.path()).collect())
}

/// Walks `root` in sorted order, skipping dot-directories and `skip_dirs`.
pub fn walk_sources(
    root: &Path,
    extensions: &[&str],
    skip_dirs: &[&str],
) -> Result<Vec<SourceFile>, ExtractError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in read_dir_entries(&dir)? {
            let name = entry
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            if entry.is_dir() {
                if !name.starts_with('.') && !skip_dirs.contains(&name.as_str()) {
                    stack.push(entry);
                }
            } else if entry.is_file()
                && entry
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| extensions.contains(&ext))
            {
                files.push(entry);
            }
        }
    }
    files.sort();
    let mut out = Vec::with_capacity(files.len());
    for path in files {
        let text = fs::read_to_string(&path).map_err(|err| ExtractError::io(&path, &err))?;
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        out.push(SourceFile { path: rel, text });
    }
    Ok(out)
}

#[must_use]
pub(crate) fn line_of(text: &str, offset: usize) -> u32 {
    let end = offset.min(text.len());
    u32::try_from(text.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() + 1)
        .unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Dialect {
    Script,
    Rust,
}

impl Dialect {
    fn is_quote(self, b: u8) -> bool {
        match self {
            Self::Script => matches!(b, b'\'' | b'"' | b'`'),
            Self::Rust => b == b'"',
        }
    }
}

/// Index just past a string literal or comment starting at `at`, if any.
fn skip_literal(bytes: &[u8], at: usize, dialect: Dialect) -> Option<usize> {
    let b = bytes[at];
    if dialect.is_quote(b) {
        let mut i = at + 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                c if c == b => return Some(i + 1),
                _ => i += 1,
            }
        }
        return Some(bytes.len());
    }
    if b == b'/' && bytes.get(at + 1) == Some(&b'/') {
        let end = bytes[at..]
            .iter()
            .position(|c| *c == b'\n')
            .map_or(bytes.len(), |p| at + p);
        return Some(end);
    }
    if b == b'/' && bytes.get(at + 1) == Some(&b'*') {
        let end = bytes[at + 2..]
            .windows(2)
            .position(|w| w == b"*/")
            .map_or(bytes.len(), |p| at + 2 + p + 2);
        return Some(end);
    }
    None
}

/// Byte index of the bracket closing the one at `open`.
pub(crate) fn matching_close(text: &str, open: usize, dialect: Dialect) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        if let Some(next) = skip_literal(bytes, i, dialect) {
            i = next;
            continue;
        }
        match bytes[i] {
            b'{' | b'(' | b'[' => depth += 1,
            b'}' | b')' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Splits on commas that sit outside nested brackets and literals.
pub(crate) fn split_top_level(inner: &str, dialect: Dialect) -> Vec<&str> {
    let bytes = inner.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        if let Some(next) = skip_literal(bytes, i, dialect) {
            i = next;
            continue;
        }
        match bytes[i] {
            b'{' | b'(' | b'[' => depth += 1,
            b'}' | b')' | b']' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                parts.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&inner[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_close_skips_strings_and_comments() {
        let text = "{ a: '}', b: { c: 1 } /* } */ }";
        assert_eq!(matching_close(text, 0, Dialect::Script), Some(text.len() - 1));
    }

    #[test]
    fn split_top_level_respects_nesting() {
        let parts = split_top_level("a, b: { c, d }, e: f(1, 2)", Dialect::Script);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].trim(), "b: { c, d }");
    }

    #[test]
    fn rust_dialect_ignores_lifetimes() {
        let text = "(x: &'a str, y: Json<T>)";
        assert_eq!(matching_close(text, 0, Dialect::Rust), Some(text.len() - 1));
    }

    #[test]
    fn line_numbers_are_one_based() {
        assert_eq!(line_of("a\nb\nc", 0), 1);
        assert_eq!(line_of("a\nb\nc", 4), 3);
    }
}
