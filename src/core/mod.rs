//! Core SICD processing modules

pub mod derivation;
pub mod geocoords;
pub mod polynomial;
pub mod projection;
pub mod radiometric;
pub mod validation;

// Re-export main types
pub use derivation::{DerivationReport, DerivationStep, ScpCoaGeometry, DERIVATION_SEQUENCE};
pub use geocoords::{
    ecf_to_geodetic, ecf_to_geodetic_array, geodetic_to_ecf, geodetic_to_ecf_array, wgs84_norm,
    RicFrame,
};
pub use polynomial::{two_dim_poly_fit, Poly1D, Poly2D, PolyFit, XyzPoly};
pub use projection::{
    AdjustableParameters, CoaPoint, GroundToImageResult, ImagePoint, ProjectionConfig,
    ProjectionContext, ProjectionSurface,
};
pub use validation::{Diagnostic, ImageFormationAlgorithm, Severity, ValidationReport};
