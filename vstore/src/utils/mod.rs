pub mod cli;
pub mod locks;
pub mod path;
