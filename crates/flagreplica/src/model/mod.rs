//! Replicated data model.

pub mod change;
pub mod condition;
pub mod hint;
pub mod validation;
pub mod variant;

pub use change::{ChangeEvent, ChangeKind};
pub use condition::{
    Condition, Override, PathSegment, PropertyCondition, Reference, RenderedCondition,
    RenderedOverride, Segmentation, Value,
};
pub use hint::ChangeHint;
pub use validation::{validate_overrides, ValidationError};
pub use variant::{PartitionKey, ReplicatedVariant, VariantKey};
