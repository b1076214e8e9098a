//! Configuration loading and validation.
//!
//! Config files: `livewire.toml` or `livewire.json`, searched in `./` then
//! `~/.config/livewire/`.

pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, find_config_file, load_config, to_toml},
    schema::{LivewireConfig, MetricsConfig, StreamsConfig},
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
