pub mod log;
pub mod purge;
pub mod run;
pub mod score;
pub mod status;
