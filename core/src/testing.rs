pub mod compare;
pub mod compile;
pub mod runner;
pub mod sandbox;
pub mod testcase;

pub use compare::*;
pub use compile::*;
pub use runner::*;
pub use sandbox::{Limits, NsjailSandbox, RlimitSandbox, Sandbox};
pub use testcase::*;
