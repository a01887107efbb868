//! User interface rendering and input handling.
//!
//! - **renderer**: draws session snapshots onto the host console
//! - **keymapper**: keyboard and mouse input to VT byte sequences

pub mod keymapper;
pub mod renderer;

pub use keymapper::*;
pub use renderer::*;
