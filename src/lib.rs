pub mod cli;
pub mod completion;
pub mod config;
pub mod error;
pub mod federation;
pub mod master;
pub mod orchestration;
pub mod safety;
pub mod worker;
