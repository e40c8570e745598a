//! Node configuration

pub mod settings;

pub use settings::{ChainBinding, PipelineConfig, get_config_file_path};
