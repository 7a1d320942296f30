pub mod checkpoint;
pub mod data;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod training;
pub mod utils;
