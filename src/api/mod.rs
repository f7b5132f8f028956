//! The Service Facade (spec.md §6.1): the one surface this crate exposes to an
//! external HTTP/UI layer. Everything HTTP-shaped — routing, request parsing,
//! OpenAPI docs, authentication itself — lives outside this crate; callers arrive
//! here with an already-validated [`crate::domain::Principal`].

pub mod error;
pub mod facade;

pub use error::{FacadeError, FacadeResult};
pub use facade::ApiFacade;
