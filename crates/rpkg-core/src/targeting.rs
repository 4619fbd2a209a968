//! Selection of the resources an eval task hands to its function.

use crate::CoreError;
use rpkg_schema::{
    is_manifest_path, normalize_subpackage, parse_manifests, FunctionEvalTaskSpec, PackageTree,
    Resource, Selector,
};

/// Every non-empty selector field must equal the resource's attribute.
/// Comparison is case-sensitive; an empty selector matches everything.
pub fn matches(selector: &Selector, resource: &Resource) -> bool {
    field_matches(&selector.api_version, resource.api_version())
        && field_matches(&selector.kind, resource.kind())
        && field_matches(&selector.name, resource.name())
        && field_matches(&selector.namespace, resource.namespace())
}

fn field_matches(wanted: &str, actual: &str) -> bool {
    wanted.is_empty() || wanted == actual
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    /// Normalized subpackage directory the selection was scoped to.
    pub subpackage: String,
    /// Matched resources, in path then document order.
    pub items: Vec<Resource>,
    /// Resources considered before the selector was applied.
    pub scanned: usize,
}

/// Validate `spec`, then collect the resources it targets: in scope of the
/// subpackage, not meta resources unless asked for, and matching the selector.
pub fn select_resources(
    tree: &PackageTree,
    spec: &FunctionEvalTaskSpec,
) -> Result<Selection, CoreError> {
    spec.validate()?;
    let subpackage = normalize_subpackage(&spec.subpackage)?;

    let mut selection = Selection {
        subpackage,
        ..Selection::default()
    };
    for (path, contents) in tree.iter() {
        if !is_manifest_path(path) || !PackageTree::in_scope(path, &selection.subpackage) {
            continue;
        }
        for resource in parse_manifests(path, contents)? {
            if resource.is_meta() && !spec.include_meta_resources {
                continue;
            }
            selection.scanned += 1;
            if matches(&spec.selector, &resource) {
                selection.items.push(resource);
            }
        }
    }
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpkg_schema::FunctionRef;

    const APP: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: prod
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: prod
";

    const KPTFILE: &str = "\
apiVersion: kpt.dev/v1
kind: Kptfile
metadata:
  name: pkg
  annotations:
    config.kubernetes.io/local-config: \"true\"
";

    fn tree() -> PackageTree {
        PackageTree::from_files([
            ("Kptfile", KPTFILE),
            ("app.yaml", APP),
            ("README.md", "# not yaml: [\n"),
            (
                "db/db.yaml",
                "apiVersion: apps/v1\nkind: StatefulSet\nmetadata:\n  name: db\n",
            ),
        ])
        .unwrap()
    }

    fn spec(selector: Selector) -> FunctionEvalTaskSpec {
        FunctionEvalTaskSpec {
            image: "gcr.io/kpt-fn/set-labels:v0.2".to_owned(),
            selector,
            ..FunctionEvalTaskSpec::default()
        }
    }

    #[test]
    fn empty_selector_matches_all_but_meta() {
        let selection = select_resources(&tree(), &spec(Selector::default())).unwrap();
        let names: Vec<_> = selection.items.iter().map(Resource::name).collect();
        assert_eq!(names, ["web", "settings", "db"]);
        assert_eq!(selection.scanned, 3);
    }

    #[test]
    fn meta_resources_included_on_request() {
        let mut s = spec(Selector::default());
        s.include_meta_resources = true;
        let selection = select_resources(&tree(), &s).unwrap();
        assert_eq!(selection.items.len(), 4);
        assert_eq!(selection.items[0].kind(), "Kptfile");
    }

    #[test]
    fn every_non_empty_field_must_match() {
        let selection = select_resources(
            &tree(),
            &spec(Selector {
                kind: "ConfigMap".to_owned(),
                namespace: "prod".to_owned(),
                ..Selector::default()
            }),
        )
        .unwrap();
        assert_eq!(selection.items.len(), 1);
        assert_eq!(selection.items[0].name(), "settings");
        assert_eq!(selection.items[0].index, 1);
    }

    #[test]
    fn matching_is_case_sensitive() {
        let selection = select_resources(
            &tree(),
            &spec(Selector {
                kind: "configmap".to_owned(),
                ..Selector::default()
            }),
        )
        .unwrap();
        assert!(selection.items.is_empty());
    }

    #[test]
    fn subpackage_scopes_paths() {
        let mut s = spec(Selector::default());
        s.subpackage = "db/".to_owned();
        let selection = select_resources(&tree(), &s).unwrap();
        assert_eq!(selection.subpackage, "db");
        assert_eq!(selection.items.len(), 1);
        assert_eq!(selection.items[0].path, "db/db.yaml");
    }

    #[test]
    fn invalid_spec_rejected_before_selection() {
        let mut s = spec(Selector::default());
        s.function_ref = Some(FunctionRef {
            name: "set-labels".to_owned(),
        });
        let err = select_resources(&tree(), &s).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn unparsable_manifest_in_scope_fails() {
        let mut t = tree();
        t.insert("broken.yaml", "kind: [unclosed\n").unwrap();
        let err = select_resources(&t, &spec(Selector::default())).unwrap_err();
        assert!(matches!(err, CoreError::Resource(_)));
    }
}
