pub mod cli;
pub mod cloud;
pub mod config;
pub mod frontend;
pub mod healthcheck;
pub mod run;
pub mod shard;
pub mod sharder;
pub mod sighup;
pub mod unique_id;
pub mod util;
