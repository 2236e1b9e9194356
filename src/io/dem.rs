use crate::types::{SicdError, SicdResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Terrain height source used by DEM projection.
///
/// Heights are metres above the WGS-84 ellipsoid. `None` means the location
/// is outside coverage or holds no data.
pub trait DemSurface: Send + Sync {
    fn height(&self, lat: f64, lon: f64) -> Option<f64>;
}

impl<F> DemSurface for F
where
    F: Fn(f64, f64) -> Option<f64> + Send + Sync,
{
    fn height(&self, lat: f64, lon: f64) -> Option<f64> {
        self(lat, lon)
    }
}

/// Same height everywhere
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantHeight(pub f64);

impl DemSurface for ConstantHeight {
    fn height(&self, _lat: f64, _lon: f64) -> Option<f64> {
        Some(self.0)
    }
}

/// Affine transform from grid (col, row) to (lon, lat), GDAL ordering
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up grid with the given upper left corner and spacing (degrees)
    pub fn north_up(top_left_lon: f64, top_left_lat: f64, spacing: f64) -> Self {
        Self {
            top_left_x: top_left_lon,
            pixel_width: spacing,
            rotation_x: 0.0,
            top_left_y: top_left_lat,
            rotation_y: 0.0,
            pixel_height: -spacing,
        }
    }

    /// Fractional (row, col) of a location. Rotated grids are not supported.
    fn to_pixel(&self, lat: f64, lon: f64) -> (f64, f64) {
        (
            (lat - self.top_left_y) / self.pixel_height,
            (lon - self.top_left_x) / self.pixel_width,
        )
    }
}

/// Regular lat/lon elevation grid with bilinear interpolation
#[derive(Debug, Clone)]
pub struct GriddedDem {
    heights: Array2<f32>,
    transform: GeoTransform,
    nodata: Option<f32>,
}

impl GriddedDem {
    pub fn new(
        heights: Array2<f32>,
        transform: GeoTransform,
        nodata: Option<f32>,
    ) -> SicdResult<Self> {
        let (rows, cols) = heights.dim();
        if rows < 2 || cols < 2 {
            return Err(SicdError::InvalidArgument(format!(
                "DEM grid must be at least 2 x 2, got {} x {}",
                rows, cols
            )));
        }
        if transform.rotation_x != 0.0 || transform.rotation_y != 0.0 {
            return Err(SicdError::UnsupportedConfiguration(
                "rotated DEM geotransforms are not supported".to_string(),
            ));
        }
        if transform.pixel_width == 0.0 || transform.pixel_height == 0.0 {
            return Err(SicdError::InvalidArgument(
                "DEM pixel spacing must be non-zero".to_string(),
            ));
        }
        log::debug!("DEM grid: {}x{} samples, transform {:?}", rows, cols, transform);
        Ok(Self {
            heights,
            transform,
            nodata,
        })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.heights.dim()
    }

    fn is_void(&self, value: f32) -> bool {
        value.is_nan() || self.nodata.map_or(false, |nd| value == nd)
    }
}

impl DemSurface for GriddedDem {
    fn height(&self, lat: f64, lon: f64) -> Option<f64> {
        let (row, col) = self.transform.to_pixel(lat, lon);
        let (rows, cols) = self.heights.dim();
        if !(row >= 0.0 && col >= 0.0) || row > (rows - 1) as f64 || col > (cols - 1) as f64 {
            return None;
        }

        let y1 = (row.floor() as usize).min(rows - 2);
        let x1 = (col.floor() as usize).min(cols - 2);
        let (y2, x2) = (y1 + 1, x1 + 1);
        let dy = row - y1 as f64;
        let dx = col - x1 as f64;

        let corners = [
            self.heights[[y1, x1]],
            self.heights[[y1, x2]],
            self.heights[[y2, x1]],
            self.heights[[y2, x2]],
        ];
        if corners.iter().any(|&v| self.is_void(v)) {
            return None;
        }
        let [v11, v21, v12, v22] = corners.map(f64::from);

        Some(
            v11 * (1.0 - dx) * (1.0 - dy)
                + v21 * dx * (1.0 - dy)
                + v12 * (1.0 - dx) * dy
                + v22 * dx * dy,
        )
    }
}
