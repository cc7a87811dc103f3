pub mod client_util;
pub mod cr_patch;
pub mod expander;
pub mod hooks;
pub mod indexer;
pub mod metrics;
pub mod resource_class;
pub mod size;
pub mod telemetry;

/// Annotation on a StorageClass that opts its claims into automatic expansion.
pub const AUTO_RESIZE_ENABLED_KEY: &str = "resize.anvil.dev/enabled";

/// Low-water mark for free bytes. Percent of capacity or an absolute quantity.
pub const RESIZE_THRESHOLD_ANNOTATION: &str = "resize.anvil.dev/threshold";

/// Low-water mark for free inodes. Percent only.
pub const RESIZE_INODES_THRESHOLD_ANNOTATION: &str = "resize.anvil.dev/inodes-threshold";

/// Amount by which to grow on trigger. Percent of current capacity or absolute.
pub const RESIZE_INCREASE_ANNOTATION: &str = "resize.anvil.dev/increase";

/// Upper bound on the requested size. Absolute quantity; zero or missing
/// makes the claim ineligible.
pub const STORAGE_LIMIT_ANNOTATION: &str = "resize.anvil.dev/storage_limit";

/// Stamped by the expander with the capacity observed at the moment of a
/// resize request, for in-progress detection.
pub const PREVIOUS_CAPACITY_BYTES_ANNOTATION: &str = "resize.anvil.dev/pre_capacity_bytes";

/// Label key: new claims sharing the value under this label join a
/// size-sharing group at creation time.
pub const INITIAL_RESIZE_GROUP_BY_ANNOTATION: &str = "resize.anvil.dev/initial-resize-group-by";

/// Names an entry in the resource-class catalog; enables CR patching for
/// the claim.
pub const TARGET_RESOURCE_CLASS_ANNOTATION: &str = "resize.anvil.dev/target-resource-class";

/// Name of the target custom resource in the claim's namespace.
pub const TARGET_RESOURCE_NAME_ANNOTATION: &str = "resize.anvil.dev/target-resource-name";

/// Supplies the value for a `[key=?]` placeholder in the class path.
pub const TARGET_FILTER_VALUE_ANNOTATION: &str = "resize.anvil.dev/target-filter-value";

/// Annotation on a StatefulSet that opts its provisioned claims into
/// template annotation propagation.
pub const ANNOTATION_PATCHING_ENABLED_KEY: &str = "resize.anvil.dev/annotation-patching-enabled";

pub const DEFAULT_THRESHOLD: &str = "10%";
pub const DEFAULT_INODES_THRESHOLD: &str = "10%";
pub const DEFAULT_INCREASE: &str = "10%";
