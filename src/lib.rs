pub mod audio;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod featurizer;
pub mod model;
pub mod runtime;
pub mod session;
pub mod strategy;
pub mod train;
