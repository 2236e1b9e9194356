//! sicdproj: SICD metadata validation and Center-Of-Aperture projection
//!
//! This library models the SICD parameter blocks needed to relate image
//! pixels to ground locations, completes partially populated metadata, and
//! projects between image coordinates and ECF/geodetic ground coordinates
//! using the COA range/range-rate model of the image formation algorithm.

pub mod types;
pub mod metadata;
pub mod core;
pub mod io;

// Re-export main types and functions for easier access
pub use types::{
    AdjustFrame, CoordinateOrdering, GeodeticPoint, GridType, ImageFormAlgo, ProjectionType,
    RowCol, SicdError, SicdResult, SideOfTrack,
};

pub use crate::core::{
    AdjustableParameters, Diagnostic, GroundToImageResult, ProjectionConfig, ProjectionContext,
    ProjectionSurface, Severity, ValidationReport,
};
pub use io::{ConstantHeight, DemSurface, GriddedDem};
pub use metadata::Sicd;

#[cfg(feature = "python")]
mod python {
    use crate::core::geocoords;
    use crate::io::GriddedDem;
    use crate::io::GeoTransform;
    use crate::{CoordinateOrdering, ProjectionConfig, Sicd, SicdError};
    use numpy::{IntoPyArray, PyArray1, PyArray2, PyReadonlyArray2};
    use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
    use pyo3::prelude::*;

    impl From<SicdError> for PyErr {
        fn from(err: SicdError) -> PyErr {
            match err {
                SicdError::Io(e) => PyIOError::new_err(e.to_string()),
                SicdError::Json(e) => PyValueError::new_err(e.to_string()),
                SicdError::InvalidArgument(_)
                | SicdError::OutOfDomain(_)
                | SicdError::UnsupportedConfiguration(_) => PyValueError::new_err(err.to_string()),
                other => PyRuntimeError::new_err(other.to_string()),
            }
        }
    }

    fn parse_ordering(ordering: &str) -> PyResult<CoordinateOrdering> {
        Ok(ordering.parse::<CoordinateOrdering>()?)
    }

    fn parse_config(config_json: Option<&str>) -> PyResult<ProjectionConfig> {
        match config_json {
            Some(json) => Ok(ProjectionConfig::from_json_str(json)?),
            None => Ok(ProjectionConfig::default()),
        }
    }

    /// Convert `N x 3` geodetic points to ECF
    #[pyfunction]
    #[pyo3(signature = (coords, ordering = "latlong"))]
    fn geodetic_to_ecf<'py>(
        py: Python<'py>,
        coords: PyReadonlyArray2<f64>,
        ordering: &str,
    ) -> PyResult<&'py PyArray2<f64>> {
        let ordering = parse_ordering(ordering)?;
        let ecf = geocoords::geodetic_to_ecf_array(&coords.as_array().to_owned(), ordering)?;
        Ok(ecf.into_pyarray(py))
    }

    /// Convert `N x 3` ECF points to geodetic
    #[pyfunction]
    #[pyo3(signature = (coords, ordering = "latlong"))]
    fn ecf_to_geodetic<'py>(
        py: Python<'py>,
        coords: PyReadonlyArray2<f64>,
        ordering: &str,
    ) -> PyResult<&'py PyArray2<f64>> {
        let ordering = parse_ordering(ordering)?;
        let geo = geocoords::ecf_to_geodetic_array(&coords.as_array().to_owned(), ordering)?;
        Ok(geo.into_pyarray(py))
    }

    /// Projection bound to one SICD metadata instance
    #[pyclass(name = "Projector")]
    struct PyProjector {
        inner: Sicd,
        dem: Option<GriddedDem>,
    }

    #[pymethods]
    impl PyProjector {
        /// Build from SICD metadata JSON, completing derived fields
        #[new]
        #[pyo3(signature = (metadata_json, derive = true))]
        fn new(metadata_json: &str, derive: bool) -> PyResult<Self> {
            let mut sicd = Sicd::from_json_str(metadata_json)?;
            if derive {
                sicd.derive();
            }
            if !sicd.can_project() {
                return Err(PyValueError::new_err(
                    "SICD metadata does not support COA projection",
                ));
            }
            Ok(PyProjector {
                inner: sicd,
                dem: None,
            })
        }

        /// Attach a north-up DEM grid (degrees) for "DEM" projection
        #[pyo3(signature = (heights, top_left_lon, top_left_lat, spacing, nodata = None))]
        fn set_dem(
            &mut self,
            heights: PyReadonlyArray2<f32>,
            top_left_lon: f64,
            top_left_lat: f64,
            spacing: f64,
            nodata: Option<f32>,
        ) -> PyResult<()> {
            let transform = GeoTransform::north_up(top_left_lon, top_left_lat, spacing);
            self.dem = Some(GriddedDem::new(heights.as_array().to_owned(), transform, nodata)?);
            Ok(())
        }

        /// Validation findings as (severity, field, message) tuples
        fn validate(&self) -> Vec<(String, String, String)> {
            self.inner
                .validate()
                .diagnostics
                .into_iter()
                .map(|d| (format!("{:?}", d.severity), d.field, d.message))
                .collect()
        }

        fn metadata_json(&self) -> PyResult<String> {
            Ok(self.inner.to_json_string()?)
        }

        /// Returns (image points, residuals, iterations)
        #[pyo3(signature = (coords, config_json = None, ordering = None))]
        fn ground_to_image<'py>(
            &self,
            py: Python<'py>,
            coords: PyReadonlyArray2<f64>,
            config_json: Option<&str>,
            ordering: Option<&str>,
        ) -> PyResult<(&'py PyArray2<f64>, &'py PyArray1<f64>, usize)> {
            let config = parse_config(config_json)?;
            let coords = coords.as_array().to_owned();
            let result = match ordering {
                Some(ordering) => self.inner.project_ground_to_image_geo(
                    &coords,
                    parse_ordering(ordering)?,
                    &config,
                )?,
                None => self.inner.project_ground_to_image(&coords, &config)?,
            };
            Ok((
                result.image_points.into_pyarray(py),
                result.residuals.into_pyarray(py),
                result.iterations,
            ))
        }

        /// ECF output, or geodetic when an ordering is given
        #[pyo3(signature = (image_points, config_json = None, ordering = None))]
        fn image_to_ground<'py>(
            &self,
            py: Python<'py>,
            image_points: PyReadonlyArray2<f64>,
            config_json: Option<&str>,
            ordering: Option<&str>,
        ) -> PyResult<&'py PyArray2<f64>> {
            let config = parse_config(config_json)?;
            let points = image_points.as_array().to_owned();
            let dem = self.dem.as_ref().map(|d| d as &dyn crate::DemSurface);
            let ground = match ordering {
                Some(ordering) => self.inner.project_image_to_ground_geo(
                    &points,
                    parse_ordering(ordering)?,
                    &config,
                    dem,
                )?,
                None => self.inner.project_image_to_ground(&points, &config, dem)?,
            };
            Ok(ground.into_pyarray(py))
        }

        fn __repr__(&self) -> String {
            format!(
                "Projector(grid_type={}, dem={})",
                self.inner
                    .grid_type()
                    .map_or_else(|| "None".to_string(), |g| g.to_string()),
                self.dem.is_some()
            )
        }
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_class::<PyProjector>()?;
        m.add_function(wrap_pyfunction!(geodetic_to_ecf, m)?)?;
        m.add_function(wrap_pyfunction!(ecf_to_geodetic, m)?)?;
        Ok(())
    }
}
