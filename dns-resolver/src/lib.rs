#![warn(clippy::pedantic)]
#![allow(clippy::redundant_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

pub mod blocklist;
pub mod cache;
pub mod context;
pub mod forwarder;
pub mod metrics;
pub mod resolver;
pub mod zonecache;
