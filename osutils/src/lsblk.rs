use std::{collections::HashMap, path::PathBuf};

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// A labelled partition as reported by `lsblk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Partition label.
    pub label: String,

    /// Full path to the partition node, e.g. `/dev/sda3`.
    pub device_path: PathBuf,

    /// Full path to the whole-disk device, e.g. `/dev/sda`.
    pub parent_path: PathBuf,

    /// Where the partition is mounted, if anywhere.
    pub mountpoint: Option<PathBuf>,
}

/// Lists the partitions whose label is one of `recognised_labels`, in the
/// order lsblk reports them.
///
/// The option set is fixed so the output stays machine-parseable across
/// util-linux versions: key="value" pairs, ASCII tree characters, no
/// headings. An empty result is not an error; deciding whether the layout
/// makes sense is the caller's job.
pub fn probe(recognised_labels: &[&str]) -> Result<Vec<BlockDevice>, Error> {
    let lines = Dependency::Lsblk
        .cmd()
        .arg("--ascii")
        .arg("--noheadings")
        .arg("--output=NAME,LABEL,PKNAME,MOUNTPOINT")
        .arg("--pairs")
        .output_lines()
        .context("Failed to execute lsblk")?;

    Ok(parse_pairs_output(&lines, recognised_labels))
}

fn parse_pairs_output(lines: &[String], recognised_labels: &[&str]) -> Vec<BlockDevice> {
    lines
        .iter()
        .filter_map(|line| {
            let fields = parse_pairs_line(line);

            let label = fields.get("LABEL")?;
            if label.is_empty() || !recognised_labels.contains(&label.as_str()) {
                return None;
            }

            let name = fields.get("NAME")?;
            let parent = fields.get("PKNAME").map(String::as_str).unwrap_or("");
            let mountpoint = fields
                .get("MOUNTPOINT")
                .filter(|m| !m.is_empty())
                .map(PathBuf::from);

            Some(BlockDevice {
                label: label.clone(),
                device_path: PathBuf::from(format!("/dev/{name}")),
                parent_path: PathBuf::from(format!("/dev/{parent}")),
                mountpoint,
            })
        })
        .collect()
}

/// Splits one line of `lsblk --pairs` output into a field map.
///
/// A field is a bareword or a double-quoted run with no embedded quotes;
/// fields split on the first `=` and quotes are stripped from the value.
pub fn parse_pairs_line(line: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();

    for token in tokenize_pairs(line) {
        let Some((name, value)) = token.split_once('=') else {
            continue;
        };
        fields.insert(name.to_owned(), value.trim_matches('"').to_owned());
    }

    fields
}

/// Tokens are runs of non-whitespace where double-quoted sections may
/// contain whitespace.
fn tokenize_pairs(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;
    use pretty_assertions::assert_eq;

    const RECOGNISED: &[&str] = &["system-a", "system-b", "system-boot", "writable"];

    /// Output obtained from `lsblk --ascii --noheadings
    /// --output=NAME,LABEL,PKNAME,MOUNTPOINT --pairs` on a dual-rootfs
    /// BeagleBone image, lsblk from util-linux 2.25.2.
    const SAMPLE_LSBLK_OUTPUT: &str = indoc! {r#"
        NAME="mmcblk0" LABEL="" PKNAME="" MOUNTPOINT=""
        NAME="mmcblk0p1" LABEL="system-boot" PKNAME="mmcblk0" MOUNTPOINT="/boot/uboot"
        NAME="mmcblk0p2" LABEL="system-a" PKNAME="mmcblk0" MOUNTPOINT="/"
        NAME="mmcblk0p3" LABEL="system-b" PKNAME="mmcblk0" MOUNTPOINT=""
        NAME="mmcblk0p4" LABEL="writable" PKNAME="mmcblk0" MOUNTPOINT="/writable"
        NAME="sr0" LABEL="My Disk" PKNAME="" MOUNTPOINT=""
    "#};

    fn sample_lines() -> Vec<String> {
        SAMPLE_LSBLK_OUTPUT.lines().map(str::to_owned).collect()
    }

    #[test]
    fn test_parse_pairs_line() {
        let fields =
            parse_pairs_line(r#"NAME="sda3" LABEL="system-b" PKNAME="sda" MOUNTPOINT="""#);
        assert_eq!(fields["NAME"], "sda3");
        assert_eq!(fields["LABEL"], "system-b");
        assert_eq!(fields["PKNAME"], "sda");
        assert_eq!(fields["MOUNTPOINT"], "");
    }

    #[test]
    fn test_parse_pairs_line_quoted_whitespace() {
        let fields = parse_pairs_line(r#"NAME="sr0" LABEL="My Disk" PKNAME="""#);
        assert_eq!(fields["LABEL"], "My Disk");
    }

    #[test]
    fn test_parse_pairs_line_ignores_malformed_tokens() {
        let fields = parse_pairs_line(r#"NAME="sda1" garbage LABEL="writable""#);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["LABEL"], "writable");
    }

    #[test]
    fn test_parse_output_filters_and_orders() {
        let devices = parse_pairs_output(&sample_lines(), RECOGNISED);

        assert_eq!(
            devices,
            vec![
                BlockDevice {
                    label: "system-boot".into(),
                    device_path: "/dev/mmcblk0p1".into(),
                    parent_path: "/dev/mmcblk0".into(),
                    mountpoint: Some("/boot/uboot".into()),
                },
                BlockDevice {
                    label: "system-a".into(),
                    device_path: "/dev/mmcblk0p2".into(),
                    parent_path: "/dev/mmcblk0".into(),
                    mountpoint: Some("/".into()),
                },
                BlockDevice {
                    label: "system-b".into(),
                    device_path: "/dev/mmcblk0p3".into(),
                    parent_path: "/dev/mmcblk0".into(),
                    mountpoint: None,
                },
                BlockDevice {
                    label: "writable".into(),
                    device_path: "/dev/mmcblk0p4".into(),
                    parent_path: "/dev/mmcblk0".into(),
                    mountpoint: Some("/writable".into()),
                },
            ]
        );
    }

    #[test]
    fn test_parse_output_empty_input() {
        assert!(parse_pairs_output(&[], RECOGNISED).is_empty());
    }
}
