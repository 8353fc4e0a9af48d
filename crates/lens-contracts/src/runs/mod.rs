pub mod activity_log;
pub mod results;
pub mod status;
pub mod summary;
