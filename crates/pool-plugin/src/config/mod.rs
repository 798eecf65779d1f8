pub mod cli;
pub mod pool;
pub mod run;

pub use cli::*;
pub use pool::*;
pub use run::*;
