//! Built-in control-flow nodes.
//!
//! - `switch` -- conditional branch (OR of AND condition groups, first match wins)
//! - `foreach` -- runs its loop body as a subflow once per collection element
//! - `confirm` -- pauses the run until a confirmer approves or declines

pub mod confirm;
pub mod foreach;
pub mod switch;

pub use confirm::ConfirmNode;
pub use foreach::ForeachNode;
pub use switch::SwitchNode;
