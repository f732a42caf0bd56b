//! Resumable crawl pipeline that turns API documentation pages into
//! structured change records with code examples.

pub mod checkpoint;
pub mod code_examples;
pub mod config;
pub mod errors;
pub mod extract;
pub mod fetcher;
pub mod filter;
pub mod llm;
pub mod page;
pub mod pipeline;
pub mod prompts;
pub mod record;
pub mod resolve;
pub mod sitemap;
pub mod store;
