//! Delivery handlers.
//!
//! - [`Handler`], [`HandlerRef`], [`HandlerFn`] the seam and a closure adapter
//! - [`ExecHandler`] runs a command per message
//! - [`HttpHandler`] POSTs a JSON document (feature `http`)
//! - [`EmailHandler`] sends mail through a [`Mailer`]
//! - [`RepublishHandler`] forwards to another exchange

mod email;
mod exec;
mod handler;
#[cfg(feature = "http")]
mod http;
mod republish;

pub use email::{EmailHandler, Mail, Mailer, SUBJECT_HEADER, TO_HEADER};
pub use exec::ExecHandler;
pub use handler::{Handler, HandlerFn, HandlerRef};
#[cfg(feature = "http")]
pub use http::{ForwardDocument, HttpHandler};
pub use republish::RepublishHandler;
