//! Pure domain logic for the Fabula render core.
//!
//! Zero internal dependencies so it can be used by the ComfyUI client
//! crate, the API layer, and any future worker tooling alike. Holds
//! the aspect-ratio tables, save-path naming rules, and the node-class
//! dispatch tables that drive graph templating.

pub mod aspect;
pub mod naming;
pub mod node_classes;
