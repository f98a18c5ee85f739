//! Hangar core types: resource documents, stages, revisions and the error taxonomy.

#![forbid(unsafe_code)]

mod error;
pub mod json;
mod resource;
mod revision;
mod stages;

pub use error::{is_warning, Error, MultiError, Warning};
pub use resource::{
    ReleaseRef, Resource, ResourceId, LABEL_MANAGED_BY, LABEL_RELEASE, LABEL_RELEASE_NAMESPACE, MANAGED_BY,
};
pub use revision::{History, Revision, Source};
pub use stages::{Stage, Stages, Tiers};

pub mod prelude {
    pub use super::{History, ReleaseRef, Resource, ResourceId, Revision, Source, Stages, Warning};
}
