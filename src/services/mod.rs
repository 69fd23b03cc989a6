pub mod accounts;
pub mod exchange;
pub mod matching;
pub mod persistence;
