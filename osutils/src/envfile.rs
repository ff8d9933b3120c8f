//! Headerless `key=value` environment files as read by the bootloader.
//!
//! Line-based, UTF-8, LF terminators, one pair per line, no quoting, no
//! section headers, no comments. This is the format of both the U-Boot
//! side-file and the output of `grub-editenv list`.

use std::{fs, io, path::Path};

use anyhow::{Context, Error};

use crate::files;

/// A name/value pair to apply to an environment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub name: String,
    pub value: String,
}

impl Change {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Change {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Parses environment-file content into pairs, in input order. Lines without
/// `=` are skipped.
pub fn parse_str(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .collect()
}

/// Returns the value of `name` in the given content, or None when the
/// variable is not present. Later occurrences shadow earlier ones.
pub fn lookup(content: &str, name: &str) -> Option<String> {
    parse_str(content)
        .into_iter()
        .filter(|(n, _)| n == name)
        .map(|(_, v)| v)
        .next_back()
}

/// Rewrites `path`, applying the given changes in place.
///
/// Lines whose name matches a change are replaced where they stand; changes
/// whose name never matched are appended. Unrelated lines are untouched. The
/// result is written atomically. A missing file is treated as empty, so the
/// file is recreated if it was removed by hand.
pub fn modify_name_value_file(path: impl AsRef<Path>, changes: &[Change]) -> Result<(), Error> {
    let path = path.as_ref();

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Could not read file: {}", path.display()))
        }
    };

    let mut updated: Vec<&Change> = Vec::new();
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            for change in changes {
                if line.starts_with(&format!("{}=", change.name)) {
                    updated.push(change);
                    return format!("{}={}", change.name, change.value);
                }
            }
            line.to_owned()
        })
        .collect();

    for change in changes {
        if !updated.iter().any(|c| c.name == change.name) {
            lines.push(format!("{}={}", change.name, change.value));
        }
    }

    files::atomic_write_lines(path, &lines)
}
