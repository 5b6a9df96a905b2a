pub mod cache;
pub mod catalog;
pub mod config;
pub mod content;
pub mod cosine;
pub mod entity;
pub mod error;
pub mod factors;
pub mod model;
pub mod models;
pub mod onboarding;
pub mod online;
pub mod persistence;
pub mod protocol;
pub mod retriever;
pub mod server;
pub mod sparse;
pub mod trainer;
pub mod transport;
pub mod types;
