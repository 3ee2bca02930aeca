#![warn(clippy::pedantic)]
#![allow(clippy::redundant_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

pub mod logging;
pub mod metrics;
pub mod settings;
pub mod transport;
pub mod zones;
