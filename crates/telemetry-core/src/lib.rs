//! Telemetry core: declarative stats collection, from property rendering and
//! pre-fetch filtering through normalization, tagging and a bounded worker queue.

pub mod actions;
pub mod collector;
pub mod config;
pub mod declaration;
pub mod error;
pub mod filter;
pub mod loader;
pub mod matcher;
pub mod normalize;
pub mod pattern;
pub mod property;
pub mod render;
pub mod scheduler;
pub mod tagging;
pub mod types;

pub use actions::{parse_actions, process_actions, ActionKind, Condition, DataAction};
pub use collector::{process_event, Collector, StopSignal};
pub use config::CollectorConfig;
pub use declaration::{Declaration, GlobalOptions};
pub use error::{
    DeclarationError, LoadError, SchedulerError, TelemetryError, TelemetryResult, TransformError,
};
pub use filter::{filter_properties, FilterOptions, Skeleton, StatsFilterCache};
pub use loader::{EndpointLoader, MemoryLoader};
pub use matcher::{
    get_deep_matches, get_matches, preserve_strict_matches, remove_strict_matches,
    search_any_matches, DeepMatch, MatchTree,
};
pub use normalize::{normalize, NormalizationStep, Pipeline};
pub use property::{compile_property, CompiledProperty, PropertyDescriptor, Structure};
pub use render::render;
pub use scheduler::{Done, QueueConfig, TaskId, TaskInfo, TaskQueue};
pub use tagging::{add_keys_by_tag, apply_set_tag, TagScope};
pub use types::*;
