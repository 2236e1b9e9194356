//! Elevation sources

pub mod dem;

pub use dem::{ConstantHeight, DemSurface, GeoTransform, GriddedDem};
