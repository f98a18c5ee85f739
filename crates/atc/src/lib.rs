//! Hangar ATC: a controller that turns Airway objects into live instance kinds.
//!
//! Each Airway declares a custom kind and the flight that renders it. The [`Atc`] applies the
//! kind's CRD, binds an instance reconciler to it on the shared scheduler, and keeps every
//! instance's release converged: finalizers run Mayday on deletion, unchanged output triggers a
//! drift fix, and a Ready condition tracks the release's readiness. Instances in dynamic or
//! subscription mode are re-reconciled when the resources they produced change.

#![forbid(unsafe_code)]

pub mod airway;
mod atc;
mod dispatcher;
mod instance;
mod mode;
mod reconciler;
mod state;
pub mod status;

pub use airway::{airway_crd, release_name, Airway, AirwaySpec, CrdTemplate, PruneSpec, Scope};
pub use atc::{process_evaluators, Atc, EvaluatorFactory};
pub use dispatcher::{exact_key, kind_key, DispatchHandler, EventDispatcher};
pub use instance::FINALIZER as INSTANCE_FINALIZER;
pub use mode::{Mode, ANNOTATION_OVERRIDE_MODE};
pub use reconciler::FINALIZER as AIRWAY_FINALIZER;
pub use state::{InstanceState, InstanceStates};
