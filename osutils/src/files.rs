use std::{
    fs::{self, File},
    io::Write,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};

/// Creates all directories in a path if they don't exist.
pub fn create_dirs(path: impl AsRef<Path>) -> Result<(), Error> {
    fs::create_dir_all(path.as_ref()).with_context(|| {
        format!("Could not create path: {}", path.as_ref().display())
    })
}

/// Creates a directory chain with the given mode on the leaf directories.
pub fn create_dirs_mode(path: impl AsRef<Path>, mode: u32) -> Result<(), Error> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path.as_ref())
        .with_context(|| {
            format!(
                "Could not create path {} with mode {:#o}",
                path.as_ref().display(),
                mode
            )
        })
}

/// Replaces the contents of `path` with the given lines, atomically.
///
/// The new contents are staged in `<path>.NEW` and fsynced before being
/// renamed over the target, so a reader opening the file at any instant sees
/// either the old contents or the complete new contents, never a torn write.
pub fn atomic_write_lines(path: impl AsRef<Path>, lines: &[String]) -> Result<(), Error> {
    let path = path.as_ref();
    let mut staged = path.as_os_str().to_owned();
    staged.push(".NEW");
    let staged = PathBuf::from(staged);

    let mut file = File::create(&staged)
        .with_context(|| format!("Could not create file: {}", staged.display()))?;
    for line in lines {
        writeln!(file, "{line}")
            .with_context(|| format!("Could not write to file: {}", staged.display()))?;
    }
    file.sync_all()
        .with_context(|| format!("Could not sync file: {}", staged.display()))?;
    drop(file);

    fs::rename(&staged, path).with_context(|| {
        format!(
            "Could not rename {} over {}",
            staged.display(),
            path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    #[test]
    fn test_create_dirs_mode() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("cache/system");
        create_dirs_mode(&target, 0o750).unwrap();

        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);

        // Creating an existing directory chain is fine.
        create_dirs_mode(&target, 0o750).unwrap();
    }

    #[test]
    fn test_atomic_write_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vars.txt");

        atomic_write_lines(&path, &["a=1".into(), "b=2".into()]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a=1\nb=2\n");

        // The staging file must not survive the rename.
        assert!(!dir.path().join("vars.txt.NEW").exists());

        atomic_write_lines(&path, &["a=3".into()]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a=3\n");
    }
}
