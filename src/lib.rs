pub mod config;
pub mod error;
pub mod geo_anchor;
pub mod geometry;
pub mod io;
pub mod landmarks;
pub mod map;
pub mod pose_graph;
pub mod sensors;
pub mod simulation;
pub mod system;
pub mod tracking;

pub use config::MapperConfig;
pub use error::{MapperError, ObservationError, Result, StorageError};
pub use system::Mapper;
