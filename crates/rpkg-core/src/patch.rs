//! File-level patches: applying a patch task and deriving one from two trees.

use crate::CoreError;
use rpkg_schema::{PackagePatchTaskSpec, PackageTree, PatchSpec, PatchType};
use std::collections::BTreeSet;

fn patch_error(file: &str, reason: impl Into<String>) -> CoreError {
    CoreError::Patch {
        file: file.to_owned(),
        reason: reason.into(),
    }
}

/// Apply every entry of `spec` in order. The tree is only replaced if all succeed.
pub fn apply_patches(tree: &PackageTree, spec: &PackagePatchTaskSpec) -> Result<PackageTree, CoreError> {
    let mut out = tree.clone();
    for patch in &spec.patches {
        match patch.patch_type {
            PatchType::CreateFile => {
                if out.contains(&patch.file) {
                    return Err(patch_error(&patch.file, "file already exists"));
                }
                out.insert(patch.file.as_str(), patch.contents.as_str())?;
            }
            PatchType::DeleteFile => {
                if out.remove(&patch.file).is_none() {
                    return Err(patch_error(&patch.file, "file does not exist"));
                }
            }
            PatchType::PatchFile => {
                let Some(base) = out.get(&patch.file) else {
                    return Err(patch_error(&patch.file, "file does not exist"));
                };
                let diff = diffy::Patch::from_str(&patch.contents)
                    .map_err(|e| patch_error(&patch.file, format!("invalid unified diff: {e}")))?;
                let patched = diffy::apply(base, &diff)
                    .map_err(|e| patch_error(&patch.file, format!("diff does not apply: {e}")))?;
                out.insert(patch.file.as_str(), patched)?;
            }
        }
    }
    Ok(out)
}

/// The patch taking `old` to `new`, or `None` if they are identical.
pub fn diff_trees(old: &PackageTree, new: &PackageTree) -> Option<PackagePatchTaskSpec> {
    let paths: BTreeSet<&str> = old.paths().chain(new.paths()).collect();
    let mut patches = Vec::new();
    for path in paths {
        let spec = match (old.get(path), new.get(path)) {
            (None, Some(contents)) => PatchSpec {
                file: path.to_owned(),
                contents: contents.to_owned(),
                patch_type: PatchType::CreateFile,
            },
            (Some(_), None) => PatchSpec {
                file: path.to_owned(),
                contents: String::new(),
                patch_type: PatchType::DeleteFile,
            },
            (Some(before), Some(after)) if before != after => PatchSpec {
                file: path.to_owned(),
                contents: diffy::create_patch(before, after).to_string(),
                patch_type: PatchType::PatchFile,
            },
            _ => continue,
        };
        patches.push(spec);
    }
    (!patches.is_empty()).then_some(PackagePatchTaskSpec { patches })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(files: &[(&str, &str)]) -> PackageTree {
        PackageTree::from_files(files.iter().copied()).unwrap()
    }

    fn single(file: &str, contents: &str, patch_type: PatchType) -> PackagePatchTaskSpec {
        PackagePatchTaskSpec {
            patches: vec![PatchSpec {
                file: file.to_owned(),
                contents: contents.to_owned(),
                patch_type,
            }],
        }
    }

    #[test]
    fn diff_then_apply_reproduces_target() {
        let old = tree(&[
            ("keep.yaml", "a: 1\n"),
            ("edit.yaml", "a: 1\nb: 2\nc: 3\n"),
            ("gone.txt", "bye\n"),
        ]);
        let new = tree(&[
            ("keep.yaml", "a: 1\n"),
            ("edit.yaml", "a: 1\nb: 20\nc: 3\n"),
            ("new.txt", "hello\n"),
        ]);
        let spec = diff_trees(&old, &new).unwrap();
        let types: Vec<_> = spec.patches.iter().map(|p| (p.file.as_str(), p.patch_type)).collect();
        assert_eq!(
            types,
            [
                ("edit.yaml", PatchType::PatchFile),
                ("gone.txt", PatchType::DeleteFile),
                ("new.txt", PatchType::CreateFile),
            ]
        );
        assert_eq!(apply_patches(&old, &spec).unwrap(), new);
    }

    #[test]
    fn identical_trees_have_no_diff() {
        let t = tree(&[("a.txt", "x")]);
        assert!(diff_trees(&t, &t).is_none());
    }

    #[test]
    fn create_existing_file_fails() {
        let t = tree(&[("a.txt", "x")]);
        let err = apply_patches(&t, &single("a.txt", "y", PatchType::CreateFile)).unwrap_err();
        assert!(matches!(err, CoreError::Patch { ref file, .. } if file == "a.txt"));
    }

    #[test]
    fn delete_missing_file_fails() {
        let err = apply_patches(&PackageTree::new(), &single("a.txt", "", PatchType::DeleteFile))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn mismatched_context_fails() {
        let diff = diffy::create_patch("a\nb\nc\n", "a\nB\nc\n").to_string();
        let t = tree(&[("f.txt", "x\ny\nz\n")]);
        let err = apply_patches(&t, &single("f.txt", &diff, PatchType::PatchFile)).unwrap_err();
        assert!(err.to_string().contains("does not apply"));
    }

    #[test]
    fn failed_entry_leaves_input_untouched() {
        let t = tree(&[("a.txt", "x")]);
        let spec = PackagePatchTaskSpec {
            patches: vec![
                PatchSpec {
                    file: "b.txt".to_owned(),
                    contents: "new".to_owned(),
                    patch_type: PatchType::CreateFile,
                },
                PatchSpec {
                    file: "missing.txt".to_owned(),
                    contents: String::new(),
                    patch_type: PatchType::DeleteFile,
                },
            ],
        };
        assert!(apply_patches(&t, &spec).is_err());
        assert!(!t.contains("b.txt"));
    }
}
