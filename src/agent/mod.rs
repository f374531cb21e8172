//! Remote language-model integration
//!
//! The HTTP client, and the validation pipeline that turns free-form model
//! output into structured trading signals the rest of the app can trust.

pub mod client;
pub mod validator;

pub use client::{HttpModelClient, ModelClient};
pub use validator::{ResponseValidator, ValidationFailure, ValidationOutcome};
