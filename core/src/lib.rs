pub mod cache;
pub mod db;
pub mod models;
pub mod remote;
pub mod service;
pub mod sync;
pub mod validation;
