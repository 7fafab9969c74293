pub mod command;
pub mod databases;
