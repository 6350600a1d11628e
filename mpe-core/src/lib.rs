//! Manetu Policy Engine core library exports

pub mod annotations;
pub mod backend;
pub mod bundle;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod mapper;
pub mod mrn;
pub mod record;
pub mod registry;
pub mod stream;

pub use backend::{Backend, BackendFactory, LocalBackend, MockBackend};
pub use engine::{AuthorizeOptions, PolicyEngine, PolicyEngineBuilder};
pub use error::{PolicyError, ReasonCode};
pub use record::{AccessRecord, BundleReference, Decision, Phase};
pub use registry::{Registry, ValidationErrors};
