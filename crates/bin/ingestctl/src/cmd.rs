pub mod coordinator;
pub mod run;
