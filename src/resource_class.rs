//! Administrator-authored catalog of custom resources the expander may
//! patch. Loaded once at startup; any validation failure rejects startup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::cr_patch::{normalize_path, parse_path, PathError};

/// One admin-approved target: which CR kind, and which field below
/// `/spec`, may carry a storage size.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceClass {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub api_group: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceClassCatalog {
    #[serde(default)]
    resource_classes: Vec<ResourceClass>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read resource class catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse resource class catalog: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("resource class at index {0}: name is required")]
    MissingName(usize),
    #[error("resource class {0:?}: name must be a DNS label (lowercase alphanumerics and hyphens, no leading or trailing hyphen)")]
    InvalidName(String),
    #[error("resource class {class:?}: {field} is required")]
    MissingField { class: String, field: &'static str },
    #[error("resource class {class:?}: path {path:?} must start with /spec/")]
    PathOutsideSpec { class: String, path: String },
    #[error("resource class {class:?}: path must target a specific field under /spec")]
    PathTooShallow { class: String },
    #[error("resource class {class:?}: {source}")]
    InvalidPath {
        class: String,
        #[source]
        source: PathError,
    },
    #[error("duplicate resource class name {0:?}")]
    DuplicateName(String),
}

fn dns_label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap())
}

/// Loads and validates the catalog, keyed by class name. Paths are stored
/// in normalized pointer form.
pub fn load_resource_classes(path: &Path) -> Result<HashMap<String, ResourceClass>, CatalogError> {
    let raw = std::fs::read_to_string(path)?;
    parse_resource_classes(&raw)
}

fn parse_resource_classes(raw: &str) -> Result<HashMap<String, ResourceClass>, CatalogError> {
    let catalog: ResourceClassCatalog = serde_yaml::from_str(raw)?;

    let mut classes = HashMap::with_capacity(catalog.resource_classes.len());
    for (index, mut class) in catalog.resource_classes.into_iter().enumerate() {
        validate_resource_class(&class, index)?;
        class.path = normalize_path(&class.path);
        if classes.contains_key(&class.name) {
            return Err(CatalogError::DuplicateName(class.name));
        }
        classes.insert(class.name.clone(), class);
    }
    Ok(classes)
}

fn validate_resource_class(class: &ResourceClass, index: usize) -> Result<(), CatalogError> {
    if class.name.is_empty() {
        return Err(CatalogError::MissingName(index));
    }
    if !dns_label_regex().is_match(&class.name) {
        return Err(CatalogError::InvalidName(class.name.clone()));
    }

    let required = [
        ("apiGroup", &class.api_group),
        ("apiVersion", &class.api_version),
        ("kind", &class.kind),
        ("path", &class.path),
    ];
    for (field, value) in required {
        if value.is_empty() {
            return Err(CatalogError::MissingField {
                class: class.name.clone(),
                field,
            });
        }
    }

    let path = normalize_path(&class.path);
    if path == "/spec" || path == "/spec/" {
        return Err(CatalogError::PathTooShallow {
            class: class.name.clone(),
        });
    }
    if !path.starts_with("/spec/") {
        return Err(CatalogError::PathOutsideSpec {
            class: class.name.clone(),
            path,
        });
    }
    parse_path(&path).map_err(|source| CatalogError::InvalidPath {
        class: class.name.clone(),
        source,
    })?;
    Ok(())
}
