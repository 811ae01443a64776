//! Output-tree copying with per-line property substitution
//!
//! Each configuration layer is copied into the output directory through an
//! ignore filter; every UTF-8 file has `${name}` references expanded line
//! by line, and files that are not valid UTF-8 are copied verbatim.

use std::fs;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use super::DeploymentError;
use crate::properties::{PropertyError, PropertyStore};

/// Name-based ignore rules applied to every path component while copying
#[derive(Debug)]
pub struct IgnoreRules {
    glob_set: GlobSet,
}

impl IgnoreRules {
    /// Build rules from filename patterns (`*.properties`, `.*`, ...)
    pub fn new(patterns: &[&str]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            glob_set: builder.build()?,
        })
    }

    /// Check whether a file or directory name is ignored
    pub fn matches(&self, name: &std::ffi::OsStr) -> bool {
        self.glob_set.is_match(Path::new(name))
    }
}

/// Copy `source` into `destination` through the ignore rules, expanding
/// properties in every copied text file. With `skip_existing`, files whose
/// destination already exists are left untouched (earlier layers win).
///
/// A missing source directory is tolerated: a deployment may carry only
/// one layer of loose files.
pub(crate) fn copy_tree(
    source: &Path,
    destination: &Path,
    ignore: &IgnoreRules,
    properties: &PropertyStore,
    skip_existing: bool,
) -> Result<(), DeploymentError> {
    if !source.is_dir() {
        return Ok(());
    }

    let walker = WalkDir::new(source)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !ignore.matches(entry.file_name()));

    for entry in walker {
        let entry = entry.map_err(|err| DeploymentError::Io(err.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| DeploymentError::Io(std::io::Error::other("walked path escaped source root")))?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if skip_existing && target.exists() {
            tracing::warn!(
                path = %relative.display(),
                "destination exists from an earlier layer; skipping"
            );
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_file(entry.path(), &target, properties)?;
    }
    Ok(())
}

/// Copy one file, resolving every line. Substitution failures carry the
/// source path, destination path, and 1-based line number.
fn copy_file(source: &Path, destination: &Path, properties: &PropertyStore) -> Result<(), DeploymentError> {
    let bytes = fs::read(source)?;
    let Ok(contents) = std::str::from_utf8(&bytes) else {
        fs::write(destination, &bytes)?;
        return Ok(());
    };

    let mut rendered = String::with_capacity(contents.len());
    for (index, line) in contents.split_inclusive('\n').enumerate() {
        match properties.resolve(line) {
            Ok(expanded) => rendered.push_str(&expanded),
            Err(PropertyError::UnresolvedReference { name }) => {
                return Err(DeploymentError::CopySubstitution {
                    source_path: source.to_path_buf(),
                    destination: destination.to_path_buf(),
                    line: index + 1,
                    name,
                });
            }
            Err(err) => return Err(err.into()),
        }
    }
    fs::write(destination, rendered)?;
    Ok(())
}
