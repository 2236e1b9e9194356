use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error types for SICD metadata handling and projection
#[derive(Debug, thiserror::Error)]
pub enum SicdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A required geometry parameter is absent; the payload is the field path
    #[error("Formulating a projection is not feasible because {0} is not populated")]
    MissingField(String),

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Input out of domain: {0}")]
    OutOfDomain(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for SICD operations
pub type SicdResult<T> = Result<T, SicdError>;

/// Geodetic coordinate on the WGS-84 ellipsoid (degrees, degrees, metres)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeodeticPoint {
    pub lat: f64,
    pub lon: f64,
    pub hae: f64,
}

impl GeodeticPoint {
    /// Latitude must lie in [-90, 90]; longitude is wrapped into (-180, 180].
    pub fn new(lat: f64, lon: f64, hae: f64) -> SicdResult<Self> {
        if !lat.is_finite() || !lon.is_finite() || !hae.is_finite() {
            return Err(SicdError::InvalidArgument(format!(
                "geodetic coordinates must be finite, got ({}, {}, {})",
                lat, lon, hae
            )));
        }
        if lat.abs() > 90.0 {
            return Err(SicdError::InvalidArgument(format!(
                "latitude {} is outside [-90, 90]",
                lat
            )));
        }
        Ok(Self {
            lat,
            lon: wrap_longitude(lon),
            hae,
        })
    }

    /// Pack as `[lat, lon, hae]` or `[lon, lat, hae]`
    pub fn to_array(&self, ordering: CoordinateOrdering) -> [f64; 3] {
        match ordering {
            CoordinateOrdering::LatLon => [self.lat, self.lon, self.hae],
            CoordinateOrdering::LonLat => [self.lon, self.lat, self.hae],
        }
    }

    pub fn from_array(values: [f64; 3], ordering: CoordinateOrdering) -> SicdResult<Self> {
        match ordering {
            CoordinateOrdering::LatLon => Self::new(values[0], values[1], values[2]),
            CoordinateOrdering::LonLat => Self::new(values[1], values[0], values[2]),
        }
    }
}

/// Wrap a longitude in degrees into (-180, 180]
pub fn wrap_longitude(lon: f64) -> f64 {
    let mut wrapped = lon.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped -= 360.0;
    }
    wrapped
}

/// Integer pixel location (SCPPixel, valid data vertices)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCol {
    pub row: i64,
    pub col: i64,
}

impl RowCol {
    pub fn new(row: i64, col: i64) -> Self {
        Self { row, col }
    }
}

/// Ordering of geodetic triples in batch arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CoordinateOrdering {
    /// `[lat, lon, hae]`
    #[default]
    #[serde(rename = "latlong")]
    LatLon,
    /// `[lon, lat, hae]`
    #[serde(rename = "longlat")]
    LonLat,
}

impl FromStr for CoordinateOrdering {
    type Err = SicdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "latlong" | "latlon" => Ok(CoordinateOrdering::LatLon),
            "longlat" | "lonlat" => Ok(CoordinateOrdering::LonLat),
            _ => Err(SicdError::UnsupportedConfiguration(format!(
                "unrecognized coordinate ordering {}",
                s
            ))),
        }
    }
}

/// Grid.Type values. Unknown strings are preserved so that the feasibility
/// check can report them instead of failing at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GridType {
    RgAzim,
    RgZero,
    XrgYcr,
    XctYat,
    Plane,
    Unrecognized(String),
}

impl GridType {
    /// Grid types projected through explicit row/column unit vectors
    pub const PLANE_TYPES: [GridType; 3] = [GridType::XrgYcr, GridType::XctYat, GridType::Plane];

    pub fn is_plane_type(&self) -> bool {
        Self::PLANE_TYPES.contains(self)
    }
}

impl From<&str> for GridType {
    fn from(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "RGAZIM" => GridType::RgAzim,
            "RGZERO" => GridType::RgZero,
            "XRGYCR" => GridType::XrgYcr,
            "XCTYAT" => GridType::XctYat,
            "PLANE" => GridType::Plane,
            _ => GridType::Unrecognized(s.to_string()),
        }
    }
}

impl From<String> for GridType {
    fn from(s: String) -> Self {
        GridType::from(s.as_str())
    }
}

impl From<GridType> for String {
    fn from(value: GridType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for GridType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridType::RgAzim => write!(f, "RGAZIM"),
            GridType::RgZero => write!(f, "RGZERO"),
            GridType::XrgYcr => write!(f, "XRGYCR"),
            GridType::XctYat => write!(f, "XCTYAT"),
            GridType::Plane => write!(f, "PLANE"),
            GridType::Unrecognized(s) => write!(f, "{}", s),
        }
    }
}

/// ImageFormation.ImageFormAlgo values
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ImageFormAlgo {
    Pfa,
    Rma,
    RgAzComp,
    Other,
    Unrecognized(String),
}

impl From<&str> for ImageFormAlgo {
    fn from(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "PFA" => ImageFormAlgo::Pfa,
            "RMA" => ImageFormAlgo::Rma,
            "RGAZCOMP" => ImageFormAlgo::RgAzComp,
            "OTHER" => ImageFormAlgo::Other,
            _ => ImageFormAlgo::Unrecognized(s.to_string()),
        }
    }
}

impl From<String> for ImageFormAlgo {
    fn from(s: String) -> Self {
        ImageFormAlgo::from(s.as_str())
    }
}

impl From<ImageFormAlgo> for String {
    fn from(value: ImageFormAlgo) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ImageFormAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormAlgo::Pfa => write!(f, "PFA"),
            ImageFormAlgo::Rma => write!(f, "RMA"),
            ImageFormAlgo::RgAzComp => write!(f, "RGAZCOMP"),
            ImageFormAlgo::Other => write!(f, "OTHER"),
            ImageFormAlgo::Unrecognized(s) => write!(f, "{}", s),
        }
    }
}

/// Frame in which the adjustable ARP/VARP offsets are expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum AdjustFrame {
    #[default]
    Ecf,
    RicEcf,
    RicEci,
}

impl FromStr for AdjustFrame {
    type Err = SicdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ECF" => Ok(AdjustFrame::Ecf),
            "RIC_ECF" => Ok(AdjustFrame::RicEcf),
            "RIC_ECI" => Ok(AdjustFrame::RicEci),
            _ => Err(SicdError::UnsupportedConfiguration(format!(
                "adjustable parameter frame must be one of ECF, RIC_ECF, RIC_ECI, got {}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for AdjustFrame {
    type Error = SicdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AdjustFrame> for String {
    fn from(value: AdjustFrame) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AdjustFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustFrame::Ecf => write!(f, "ECF"),
            AdjustFrame::RicEcf => write!(f, "RIC_ECF"),
            AdjustFrame::RicEci => write!(f, "RIC_ECI"),
        }
    }
}

/// Surface used when projecting image points to the ground
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum ProjectionType {
    Plane,
    #[default]
    Hae,
    Dem,
}

impl FromStr for ProjectionType {
    type Err = SicdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PLANE" => Ok(ProjectionType::Plane),
            "HAE" => Ok(ProjectionType::Hae),
            "DEM" => Ok(ProjectionType::Dem),
            _ => Err(SicdError::UnsupportedConfiguration(format!(
                "projection type must be one of PLANE, HAE, DEM, got {}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for ProjectionType {
    type Error = SicdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProjectionType> for String {
    fn from(value: ProjectionType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ProjectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectionType::Plane => write!(f, "PLANE"),
            ProjectionType::Hae => write!(f, "HAE"),
            ProjectionType::Dem => write!(f, "DEM"),
        }
    }
}

/// CollectionInfo.RadarMode.ModeType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadarModeType {
    #[serde(rename = "SPOTLIGHT")]
    Spotlight,
    #[serde(rename = "STRIPMAP")]
    Stripmap,
    #[serde(rename = "DYNAMIC STRIPMAP")]
    DynamicStripmap,
}

/// SCPCOA.SideOfTrack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SideOfTrack {
    #[serde(rename = "L")]
    Left,
    #[serde(rename = "R")]
    Right,
}

impl SideOfTrack {
    /// +1 for left looking, -1 for right looking
    pub fn look(&self) -> f64 {
        match self {
            SideOfTrack::Left => 1.0,
            SideOfTrack::Right => -1.0,
        }
    }
}

impl fmt::Display for SideOfTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideOfTrack::Left => write!(f, "L"),
            SideOfTrack::Right => write!(f, "R"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longitude_wraparound() {
        let p = GeodeticPoint::new(10.0, 190.0, 0.0).unwrap();
        assert!((p.lon - (-170.0)).abs() < 1e-12);

        let p = GeodeticPoint::new(10.0, -180.0, 0.0).unwrap();
        assert_eq!(p.lon, 180.0);

        let p = GeodeticPoint::new(-45.0, 540.0, 12.0).unwrap();
        assert_eq!(p.lon, 180.0);
    }

    #[test]
    fn test_latitude_out_of_range() {
        assert!(matches!(
            GeodeticPoint::new(90.5, 0.0, 0.0),
            Err(SicdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_grid_type_membership() {
        assert!(GridType::from("plane").is_plane_type());
        assert!(GridType::from("XCTYAT").is_plane_type());
        assert!(!GridType::RgZero.is_plane_type());
        assert_eq!(
            GridType::from("SPHERE"),
            GridType::Unrecognized("SPHERE".to_string())
        );
    }

    #[test]
    fn test_strict_config_enums() {
        assert_eq!("ric_eci".parse::<AdjustFrame>().unwrap(), AdjustFrame::RicEci);
        assert!(matches!(
            "NED".parse::<AdjustFrame>(),
            Err(SicdError::UnsupportedConfiguration(_))
        ));
        assert!(matches!(
            "GEOID".parse::<ProjectionType>(),
            Err(SicdError::UnsupportedConfiguration(_))
        ));
    }
}
