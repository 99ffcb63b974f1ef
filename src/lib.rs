pub mod api;
pub mod archive;
pub mod cli;
