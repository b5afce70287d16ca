//! ComfyUI render-job client library.
//!
//! Covers the full lifecycle of a generation job against a ComfyUI
//! server: typed graph model and UI→API conversion, template
//! parameterization (prompt, dimensions, seed, save paths, reference
//! images), HTTP submission with polling, artifact selection, and
//! queue cancellation. [`service::RenderService`] composes these into
//! the named job flows the rest of the platform calls.

pub mod api;
pub mod convert;
pub mod dispatch;
pub mod graph;
pub mod queue;
pub mod service;
pub mod template;
