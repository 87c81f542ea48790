// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::{Component, Path, PathBuf};

/// Resolve `path` to an absolute, symlink-free path. The file must exist.
pub fn absolute_path<P: AsRef<Path>>(path: P) -> io::Result<PathBuf> {
    std::fs::canonicalize(path)
}

/// Compute the path of `target` relative to the directory containing `from`.
///
/// Both files must exist; the result is what a differencing disk stores as
/// its relative parent locator.
pub fn relative_path_to<P: AsRef<Path>, Q: AsRef<Path>>(from: P, target: Q) -> io::Result<PathBuf> {
    let from = absolute_path(from)?;
    let target = absolute_path(target)?;
    let base = from
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;

    let base_comps: Vec<Component> = base.components().collect();
    let target_comps: Vec<Component> = target.components().collect();

    let common = base_comps
        .iter()
        .zip(target_comps.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base_comps.len() {
        rel.push("..");
    }
    for comp in &target_comps[common..] {
        rel.push(comp);
    }

    if rel.as_os_str().is_empty() {
        rel.push(".");
    }

    Ok(rel)
}

/// Whether `path` names an existing file.
pub fn exists<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().exists()
}

#[cfg(test)]
mod tests {
    use std::fs::{create_dir_all, File};

    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    #[test]
    fn test_relative_path_to() {
        let tmp = TempDir::new().unwrap();
        create_dir_all(tmp.as_path().join("a/b")).unwrap();
        create_dir_all(tmp.as_path().join("c")).unwrap();
        let child = tmp.as_path().join("a/b/child.vhd");
        let sibling = tmp.as_path().join("a/b/parent.vhd");
        let cousin = tmp.as_path().join("c/parent.vhd");
        File::create(&child).unwrap();
        File::create(&sibling).unwrap();
        File::create(&cousin).unwrap();

        assert_eq!(
            relative_path_to(&child, &sibling).unwrap(),
            PathBuf::from("parent.vhd")
        );
        assert_eq!(
            relative_path_to(&child, &cousin).unwrap(),
            PathBuf::from("../../c/parent.vhd")
        );
    }
}
