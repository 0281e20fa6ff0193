// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// Use README.md as crate documentation.
#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

mod engine;
pub mod evaluator;
pub mod expr;
pub mod graph;
mod number;
pub mod parser;
pub mod resolver;
pub mod schema;
pub mod template;
mod value;

pub use engine::{Diagnostic, Engine, EvaluationError};
pub use evaluator::{ConstructFactory, ConstructHandle, Evaluator, Registered, Registry};
pub use number::Number;
pub use resolver::{Resolver, TypedExpr, ValidationError};
pub use schema::TypeSystem;
pub use template::Template;
pub use value::{DeferredValue, Value};

#[cfg(test)]
mod tests;
