//! Path-directed mutation of operator-owned custom resources.
//!
//! A resource class declares which field of which CR kind may carry a
//! storage size, as a JSON-pointer-style path with at most one array
//! filter (`tablespaces[name=tbs1]` or the placeholder form
//! `tablespaces[name=?]`). The patcher navigates an untyped document to
//! the leaf and issues a merge patch.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, Patch};
use kube::core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind};
use kube::{Client, ResourceExt};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::client_util;
use crate::metrics::Metrics;
use crate::resource_class::ResourceClass;
use crate::size::format_quantity;
use crate::{
    TARGET_FILTER_VALUE_ANNOTATION, TARGET_RESOURCE_CLASS_ANNOTATION,
    TARGET_RESOURCE_NAME_ANNOTATION,
};

pub const FILTER_PLACEHOLDER: &str = "?";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathFilter {
    pub key: String,
    pub value: String,
}

/// One step of a path. `spec`, `tablespaces[name=tbs1]`, and `size` are
/// all single segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathSegment {
    pub field: String,
    pub filter: Option<PathFilter>,
}

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path {0:?} contains an empty segment")]
    EmptySegment(String),
    #[error("malformed filter in path segment {0:?}")]
    MalformedFilter(String),
    #[error("path {0:?} contains more than one filter")]
    MultipleFilters(String),
    #[error("path {0:?} ends in a filter segment; the final segment must be a field")]
    FilterOnLeaf(String),
    #[error("expected {expected} at {location:?} while navigating the document")]
    TypeMismatch {
        location: String,
        expected: &'static str,
    },
    #[error("filter {field}[{key}={value}] matches more than one element")]
    MultipleMatches {
        field: String,
        key: String,
        value: String,
    },
}

/// Rewrites tolerated spellings (`.spec.a.b`, `spec.a.b`) into JSON-Pointer
/// form (`/spec/a/b`). Pointer-form input is returned unchanged.
pub fn normalize_path(path: &str) -> String {
    let path = path.strip_prefix('.').unwrap_or(path);
    if path.starts_with('/') {
        return path.to_string();
    }
    format!("/{}", path.replace('.', "/"))
}

/// Parses a normalized path into segments, enforcing the filter grammar:
/// at most one filter overall and never on the final segment.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, PathError> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }

    let mut segments = Vec::new();
    let mut filters = 0;
    for raw in trimmed.split('/') {
        if raw.is_empty() {
            return Err(PathError::EmptySegment(path.to_string()));
        }
        let segment = parse_segment(raw)?;
        if segment.filter.is_some() {
            filters += 1;
        }
        segments.push(segment);
    }

    if filters > 1 {
        return Err(PathError::MultipleFilters(path.to_string()));
    }
    if segments.last().map(|s| s.filter.is_some()).unwrap_or(false) {
        return Err(PathError::FilterOnLeaf(path.to_string()));
    }
    Ok(segments)
}

fn parse_segment(raw: &str) -> Result<PathSegment, PathError> {
    let Some(open) = raw.find('[') else {
        if raw.contains(']') {
            return Err(PathError::MalformedFilter(raw.to_string()));
        }
        return Ok(PathSegment {
            field: raw.to_string(),
            filter: None,
        });
    };

    let field = &raw[..open];
    let rest = &raw[open + 1..];
    let Some(close) = rest.find(']') else {
        return Err(PathError::MalformedFilter(raw.to_string()));
    };
    if field.is_empty() || close != rest.len() - 1 {
        return Err(PathError::MalformedFilter(raw.to_string()));
    }

    let inner = &rest[..close];
    let Some((key, value)) = inner.split_once('=') else {
        return Err(PathError::MalformedFilter(raw.to_string()));
    };
    if key.is_empty() || value.is_empty() {
        return Err(PathError::MalformedFilter(raw.to_string()));
    }

    Ok(PathSegment {
        field: field.to_string(),
        filter: Some(PathFilter {
            key: key.to_string(),
            value: value.to_string(),
        }),
    })
}

/// Renders segments back to pointer form; the inverse of [`parse_path`]
/// up to normalization.
pub fn serialize_path(segments: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(&segment.field);
        if let Some(filter) = &segment.filter {
            out.push('[');
            out.push_str(&filter.key);
            out.push('=');
            out.push_str(&filter.value);
            out.push(']');
        }
    }
    out
}

pub fn has_placeholder(segments: &[PathSegment]) -> bool {
    segments
        .iter()
        .any(|s| s.filter.as_ref().map(|f| f.value == FILTER_PLACEHOLDER) == Some(true))
}

fn substitute_placeholder(segments: &mut [PathSegment], value: &str) {
    for segment in segments.iter_mut() {
        if let Some(filter) = segment.filter.as_mut() {
            if filter.value == FILTER_PLACEHOLDER {
                filter.value = value.to_string();
            }
        }
    }
}

/// Result of navigating to the leaf.
#[derive(Debug, PartialEq, Eq)]
pub enum SetOutcome {
    /// The leaf was written.
    Updated,
    /// An intermediate field is absent; transient state during CR
    /// creation, so the caller skips without error.
    FieldAbsent,
    /// The filter matched no array element; also a skip.
    NoMatch,
}

/// Walks `segments` through `doc` and sets the leaf field to `new_value`.
pub fn set_leaf(
    doc: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<SetOutcome, PathError> {
    let mut current = doc;
    let mut location = String::new();

    for (i, segment) in segments.iter().enumerate() {
        location.push('/');
        location.push_str(&segment.field);
        let last = i == segments.len() - 1;

        let Some(object) = current.as_object_mut() else {
            return Err(PathError::TypeMismatch {
                location,
                expected: "an object",
            });
        };

        match &segment.filter {
            None => {
                if last {
                    object.insert(segment.field.clone(), new_value);
                    return Ok(SetOutcome::Updated);
                }
                match object.get_mut(&segment.field) {
                    Some(next) => current = next,
                    None => return Ok(SetOutcome::FieldAbsent),
                }
            }
            Some(filter) => {
                let Some(value) = object.get_mut(&segment.field) else {
                    return Ok(SetOutcome::FieldAbsent);
                };
                let Some(elements) = value.as_array_mut() else {
                    return Err(PathError::TypeMismatch {
                        location,
                        expected: "an array",
                    });
                };

                let mut matched = Vec::new();
                for (idx, element) in elements.iter().enumerate() {
                    if element.get(&filter.key).and_then(Value::as_str) == Some(&filter.value) {
                        matched.push(idx);
                    }
                }
                match matched.as_slice() {
                    [] => return Ok(SetOutcome::NoMatch),
                    [idx] => current = &mut elements[*idx],
                    _ => {
                        return Err(PathError::MultipleMatches {
                            field: segment.field.clone(),
                            key: filter.key.clone(),
                            value: filter.value.clone(),
                        })
                    }
                }
            }
        }
    }

    Err(PathError::Empty)
}

/// Minimal merge-patch document turning `original` into `modified`.
/// Objects are diffed recursively; arrays and scalars are replaced
/// wholesale. Returns `None` when the documents are equal.
pub fn merge_diff(original: &Value, modified: &Value) -> Option<Value> {
    if original == modified {
        return None;
    }
    let (Some(original), Some(modified)) = (original.as_object(), modified.as_object()) else {
        return Some(modified.clone());
    };

    let mut patch = serde_json::Map::new();
    for (key, new_value) in modified {
        match original.get(key) {
            None => {
                patch.insert(key.clone(), new_value.clone());
            }
            Some(old_value) => {
                if let Some(inner) = merge_diff(old_value, new_value) {
                    patch.insert(key.clone(), inner);
                }
            }
        }
    }
    for key in original.keys() {
        if !modified.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    Some(Value::Object(patch))
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("resource class {0:?} is not in the catalog")]
    UnknownClass(String),
    #[error("annotation {0} is required for CR patching")]
    MissingAnnotation(&'static str),
    #[error("path {0:?} carries a placeholder but the filter-value annotation is not set")]
    MissingFilterValue(String),
    #[error("target {kind} {namespace}/{name} not found")]
    TargetNotFound {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error(
        "insufficient permissions to {verb} {kind} {namespace}/{name}: {source}. \
         Add an RBAC rule: apiGroups: [{group:?}], resources: [{plural:?}], \
         verbs: [\"get\", \"patch\"]"
    )]
    Forbidden {
        verb: &'static str,
        kind: String,
        namespace: String,
        name: String,
        group: String,
        plural: String,
        #[source]
        source: kube::Error,
    },
    #[error("conflict while patching {kind} {namespace}/{name}; retried on the next tick: {source}")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("failed to serialize CR document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cluster API request failed: {0}")]
    Api(#[source] kube::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The target field was updated.
    Patched,
    /// Navigation hit absent or unmatched document state; no-op this tick.
    Skipped,
    /// The leaf already carries the desired size.
    Unchanged,
}

/// Forwards a resize decision to the custom resource named by the claim's
/// target annotations instead of mutating the claim spec.
pub struct CrPatcher {
    client: Client,
    classes: HashMap<String, ResourceClass>,
    metrics: Arc<Metrics>,
}

impl CrPatcher {
    pub fn new(
        client: Client,
        classes: HashMap<String, ResourceClass>,
        metrics: Arc<Metrics>,
    ) -> Self {
        CrPatcher {
            client,
            classes,
            metrics,
        }
    }

    /// Sets the class-declared storage field of the target CR to
    /// `new_size_bytes`, rendered in canonical binary-SI form.
    pub async fn patch_target(
        &self,
        pvc: &PersistentVolumeClaim,
        new_size_bytes: i64,
    ) -> Result<PatchOutcome, PatchError> {
        let annotations = pvc.annotations();
        let class_name = annotations
            .get(TARGET_RESOURCE_CLASS_ANNOTATION)
            .ok_or(PatchError::MissingAnnotation(TARGET_RESOURCE_CLASS_ANNOTATION))?;
        let class = self
            .classes
            .get(class_name)
            .ok_or_else(|| PatchError::UnknownClass(class_name.clone()))?;
        let target_name = annotations
            .get(TARGET_RESOURCE_NAME_ANNOTATION)
            .ok_or(PatchError::MissingAnnotation(TARGET_RESOURCE_NAME_ANNOTATION))?;
        // Cross-namespace targets are unsupported.
        let namespace = pvc.metadata.namespace.clone().unwrap_or_default();

        let mut segments = parse_path(&class.path)?;
        if has_placeholder(&segments) {
            let filter_value = annotations
                .get(TARGET_FILTER_VALUE_ANNOTATION)
                .ok_or_else(|| PatchError::MissingFilterValue(class.path.clone()))?;
            substitute_placeholder(&mut segments, filter_value);
        }

        let gvk = GroupVersionKind::gvk(&class.api_group, &class.api_version, &class.kind);
        let resource = ApiResource::from_gvk(&gvk);
        let api =
            Api::<DynamicObject>::namespaced_with(self.client.clone(), &namespace, &resource);

        let target = client_util::get_dynamic(&api, &resource, target_name, &self.metrics)
            .await
            .map_err(|e| self.classify_get_error(e, class, &namespace, target_name))?;

        let original = serde_json::to_value(&target)?;
        let mut modified = original.clone();
        let new_size = Value::String(format_quantity(new_size_bytes));
        match set_leaf(&mut modified, &segments, new_size)? {
            SetOutcome::Updated => {}
            SetOutcome::FieldAbsent | SetOutcome::NoMatch => return Ok(PatchOutcome::Skipped),
        }

        let Some(mut patch) = merge_diff(&original, &modified) else {
            return Ok(PatchOutcome::Unchanged);
        };
        // Carry the resource version so interleaving writers surface as
        // conflicts rather than lost updates.
        if let (Some(rv), Some(patch)) = (&target.metadata.resource_version, patch.as_object_mut())
        {
            patch.insert(
                "metadata".to_string(),
                serde_json::json!({ "resourceVersion": rv }),
            );
        }

        client_util::patch_dynamic(
            &api,
            &resource,
            target_name,
            &Patch::Merge(&patch),
            &self.metrics,
        )
        .await
        .map_err(|e| self.classify_patch_error(e, class, &namespace, target_name))?;

        info!(
            "patched {} {}/{} at {} to {}",
            class.kind,
            namespace,
            target_name,
            serialize_path(&segments),
            format_quantity(new_size_bytes),
        );
        Ok(PatchOutcome::Patched)
    }

    fn classify_get_error(
        &self,
        err: kube::Error,
        class: &ResourceClass,
        namespace: &str,
        name: &str,
    ) -> PatchError {
        match api_error_reason(&err).as_str() {
            "NotFound" => PatchError::TargetNotFound {
                kind: class.kind.clone(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            "Forbidden" => PatchError::Forbidden {
                verb: "get",
                kind: class.kind.clone(),
                namespace: namespace.to_string(),
                name: name.to_string(),
                group: class.api_group.clone(),
                plural: class.kind.to_lowercase() + "s",
                source: err,
            },
            _ => PatchError::Api(err),
        }
    }

    fn classify_patch_error(
        &self,
        err: kube::Error,
        class: &ResourceClass,
        namespace: &str,
        name: &str,
    ) -> PatchError {
        match api_error_reason(&err).as_str() {
            "Conflict" => PatchError::Conflict {
                kind: class.kind.clone(),
                namespace: namespace.to_string(),
                name: name.to_string(),
                source: err,
            },
            "Forbidden" => PatchError::Forbidden {
                verb: "patch",
                kind: class.kind.clone(),
                namespace: namespace.to_string(),
                name: name.to_string(),
                group: class.api_group.clone(),
                plural: class.kind.to_lowercase() + "s",
                source: err,
            },
            _ => PatchError::Api(err),
        }
    }
}

fn api_error_reason(err: &kube::Error) -> String {
    match err {
        kube::Error::Api(ErrorResponse { reason, .. }) => reason.clone(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segments(path: &str) -> Vec<PathSegment> {
        parse_path(path).unwrap()
    }

    #[test]
    fn normalize_rewrites_dot_notation() {
        assert_eq!(
            normalize_path(".spec.persistence.storage"),
            "/spec/persistence/storage"
        );
        assert_eq!(
            normalize_path("spec.persistence.storage"),
            "/spec/persistence/storage"
        );
        assert_eq!(
            normalize_path("/spec/persistence/storage"),
            "/spec/persistence/storage"
        );
    }

    #[test]
    fn parse_then_serialize_round_trips() {
        for path in [
            "/spec/persistence/storage",
            "/spec/tablespaces[name=?]/storage/size",
            "/spec/volumes[id=data]/size",
        ] {
            assert_eq!(serialize_path(&segments(path)), path);
        }
    }

    #[test]
    fn parse_rejects_bad_filter_grammar() {
        assert!(matches!(
            parse_path("/spec/a[name=x]/b[id=y]/c"),
            Err(PathError::MultipleFilters(_))
        ));
        assert!(matches!(
            parse_path("/spec/a/b[name=x]"),
            Err(PathError::FilterOnLeaf(_))
        ));
        assert!(matches!(
            parse_path("/spec//size"),
            Err(PathError::EmptySegment(_))
        ));
        for bad in [
            "/spec/a[name]/b",
            "/spec/a[=x]/b",
            "/spec/a[name=]/b",
            "/spec/a[name=x/b",
            "/spec/[name=x]/b",
            "/spec/a]b/c",
        ] {
            assert!(
                matches!(parse_path(bad), Err(PathError::MalformedFilter(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(matches!(parse_path("/"), Err(PathError::Empty)));
    }

    #[test]
    fn placeholder_detection_and_substitution() {
        let mut segs = segments("/spec/tablespaces[name=?]/storage/size");
        assert!(has_placeholder(&segs));
        substitute_placeholder(&mut segs, "tbs1");
        assert!(!has_placeholder(&segs));
        assert_eq!(
            serialize_path(&segs),
            "/spec/tablespaces[name=tbs1]/storage/size"
        );
    }

    #[test]
    fn set_leaf_writes_a_nested_field() {
        let mut doc = json!({"spec": {"persistence": {"storage": "10Gi"}}});
        let outcome = set_leaf(
            &mut doc,
            &segments("/spec/persistence/storage"),
            json!("20Gi"),
        )
        .unwrap();
        assert_eq!(outcome, SetOutcome::Updated);
        assert_eq!(doc["spec"]["persistence"]["storage"], "20Gi");
    }

    #[test]
    fn set_leaf_skips_when_an_intermediate_field_is_absent() {
        let mut doc = json!({"spec": {}});
        let outcome = set_leaf(
            &mut doc,
            &segments("/spec/persistence/storage"),
            json!("20Gi"),
        )
        .unwrap();
        assert_eq!(outcome, SetOutcome::FieldAbsent);
        assert_eq!(doc, json!({"spec": {}}));
    }

    #[test]
    fn set_leaf_selects_the_unique_filtered_element() {
        let mut doc = json!({"spec": {"tablespaces": [
            {"name": "tbs1", "storage": {"size": "10Gi"}},
            {"name": "tbs2", "storage": {"size": "10Gi"}},
        ]}});
        let mut segs = segments("/spec/tablespaces[name=?]/storage/size");
        substitute_placeholder(&mut segs, "tbs1");

        let outcome = set_leaf(&mut doc, &segs, json!("50Gi")).unwrap();
        assert_eq!(outcome, SetOutcome::Updated);
        assert_eq!(doc["spec"]["tablespaces"][0]["storage"]["size"], "50Gi");
        assert_eq!(doc["spec"]["tablespaces"][1]["storage"]["size"], "10Gi");
    }

    #[test]
    fn set_leaf_skips_on_zero_matches_and_fails_on_many() {
        let mut doc = json!({"spec": {"tablespaces": [
            {"name": "tbs1"},
            {"name": "tbs1"},
        ]}});
        let segs = segments("/spec/tablespaces[name=missing]/size");
        assert_eq!(
            set_leaf(&mut doc, &segs, json!("1Gi")).unwrap(),
            SetOutcome::NoMatch
        );

        let segs = segments("/spec/tablespaces[name=tbs1]/size");
        assert!(matches!(
            set_leaf(&mut doc, &segs, json!("1Gi")),
            Err(PathError::MultipleMatches { .. })
        ));
    }

    #[test]
    fn set_leaf_rejects_non_container_nodes() {
        let mut doc = json!({"spec": {"persistence": "oops"}});
        assert!(matches!(
            set_leaf(
                &mut doc,
                &segments("/spec/persistence/storage"),
                json!("1Gi")
            ),
            Err(PathError::TypeMismatch { .. })
        ));

        let mut doc = json!({"spec": {"tablespaces": {"name": "tbs1"}}});
        assert!(matches!(
            set_leaf(
                &mut doc,
                &segments("/spec/tablespaces[name=tbs1]/size"),
                json!("1Gi")
            ),
            Err(PathError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn merge_diff_is_minimal_for_objects() {
        let original = json!({"spec": {"a": 1, "b": {"c": "x", "d": "y"}}, "status": {"ok": true}});
        let modified = json!({"spec": {"a": 1, "b": {"c": "z", "d": "y"}}, "status": {"ok": true}});
        assert_eq!(
            merge_diff(&original, &modified),
            Some(json!({"spec": {"b": {"c": "z"}}}))
        );
    }

    #[test]
    fn merge_diff_replaces_arrays_wholesale_and_nulls_removed_keys() {
        let original = json!({"items": [1, 2], "gone": 1});
        let modified = json!({"items": [1, 2, 3]});
        assert_eq!(
            merge_diff(&original, &modified),
            Some(json!({"items": [1, 2, 3], "gone": null}))
        );
        assert_eq!(merge_diff(&json!({"a": 1}), &json!({"a": 1})), None);
    }
}
