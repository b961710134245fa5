//! Core configuration model and compiler for klaxon
//!
//! This crate contains everything needed to turn a set of tenant-supplied
//! routing fragments into one validated, canonical, compressed
//! configuration document: the fragment model, qualified naming, selector
//! predicates, validation, the route-tree merge, reference resolution and
//! the serializer. It has no Kubernetes dependency; the operator crate
//! binds it to the cluster.

pub mod compile;
pub mod compiled;
pub mod name;
pub mod resolve;
pub mod route;
pub mod selector;
pub mod serialize;
pub mod validate;

pub use compile::{compile, BasePolicy, CompileError, CompileOutcome, Fragment};
pub use compiled::CompiledConfiguration;
pub use name::{QualifiedName, NULL_RECEIVER};
pub use resolve::{MapResolver, ResolveError, ResolveReference};
pub use route::{FragmentSpec, Matcher, Receiver, Route, SourceKind, SourceRef};
pub use selector::{select_fragments, LabelPredicate, NamespacePolicy};
pub use serialize::{serialize, Artifact, SerializeError};
pub use validate::{validate_fragment, ValidationError};
