pub mod cache;
pub mod compile;
pub mod config;
pub mod frontend;
pub mod judge;
pub mod language;
pub mod queue;
pub mod routes;
pub mod sandbox;
pub mod testcases;
pub mod verdict;
pub mod web_server;
pub mod worker;
