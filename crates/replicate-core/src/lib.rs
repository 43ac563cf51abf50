//! Replicate CLI core
//!
//! Turns `key=value` command-line inputs into a typed request payload against
//! a model version's schema, then submits the job and drives it to
//! completion by streaming, polling or not waiting at all.
//!
//! ## Pipeline
//!
//! - `identifier`: `owner/name[:version]` parsing
//! - `schema`: Input/Output schema access and output shape
//! - `input`: argument splitting, stdin templates, `@file` uploads
//! - `coerce`: schema-typed or inferred JSON values
//! - `execute`: strategy selection and the run entry points

pub mod client;
pub mod coerce;
pub mod config;
pub mod console;
mod error;
pub mod execute;
pub mod fakes;
pub mod identifier;
pub mod input;
pub mod job;
pub mod persist;
pub mod schema;
pub mod sse;
pub mod telemetry;

pub use client::{HttpApi, ModelApi};
pub use coerce::{coerce_inputs, infer_value, CoercedInput};
pub use config::ClientConfig;
pub use console::Console;
pub use error::{ReplicateError, Result};
pub use execute::{
    execute, run_prediction, run_training, select_strategy, ExecuteOptions, JobKind, Outcome,
    PredictionRequest, Strategy, StreamPreference, TrainingRequest,
};
pub use identifier::ModelIdentifier;
pub use input::{read_piped_stdin, resolve_inputs, RawInput, DEFAULT_SEPARATOR};
pub use job::{Job, Model, Status, StreamEvent, SubmitTarget, Version};
pub use schema::{OutputShape, Schema, SchemaType, VersionSchemas};
