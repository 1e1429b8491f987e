pub mod analytics;
pub mod audio;
pub mod clarifies;
pub mod objection;
pub mod risk;
pub mod sentiment;
