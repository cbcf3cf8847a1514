//! FITS frame ingest.
//!
//! Reads the primary image HDU and the WCS keywords the pipeline needs.
//! A frame missing a required keyword is rejected with a warning and the
//! run continues; an empty group or a group count other than three aborts
//! before Phase 1.

use std::path::{Path, PathBuf};

use fitsio::hdu::HduInfo;
use fitsio::FitsFile;
use log::{info, warn};
use ndarray::Array2;
use shared::{EquatorialPoint, GridPoint};

use crate::error::{LoadError, RunError};
use crate::frame::FrameImage;
use crate::group::GroupStacker;

/// Offset from modified to full Julian day.
const MJD_OFFSET: f64 = 2_400_000.5;

/// Load three groups of FITS frames.
///
/// Returns the groups plus the plate scale in arcsec per pixel, taken from
/// the first usable frame.
pub fn load_groups(group_paths: &[Vec<PathBuf>]) -> Result<(Vec<GroupStacker>, f64), RunError> {
    if group_paths.len() != 3 {
        return Err(RunError::GroupCount(group_paths.len()));
    }

    let mut groups = Vec::with_capacity(3);
    let mut arcsec_per_px = None;
    for (index, paths) in group_paths.iter().enumerate() {
        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            match read_frame(path) {
                Ok(frame) => {
                    arcsec_per_px.get_or_insert_with(|| plate_scale_arcsec(&frame));
                    frames.push(frame);
                }
                Err(err) => warn!("rejecting frame: {err}"),
            }
        }
        if frames.is_empty() {
            return Err(RunError::EmptyGroup(index));
        }
        // Stacking timing assumes frames in exposure order.
        frames.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        info!("group {index}: {} frame(s)", frames.len());
        groups.push(GroupStacker::new(index, frames));
    }

    Ok((groups, arcsec_per_px.unwrap_or(1.0)))
}

/// Mean absolute angular scale of a frame, arcsec per pixel.
fn plate_scale_arcsec(frame: &FrameImage) -> f64 {
    let mean_rad = (frame.scale_x.abs() + frame.scale_y.abs()) / 2.0;
    mean_rad.to_degrees() * 3600.0
}

/// Read one frame: primary image plus the §6 keyword contract.
pub fn read_frame(path: &Path) -> Result<FrameImage, LoadError> {
    let mut file = FitsFile::open(path).map_err(|source| LoadError::Fits {
        path: path.to_path_buf(),
        source,
    })?;
    let hdu = file.primary_hdu().map_err(|source| LoadError::Fits {
        path: path.to_path_buf(),
        source,
    })?;

    let shape = match &hdu.info {
        HduInfo::ImageInfo { shape, .. } if shape.len() == 2 => (shape[0], shape[1]),
        _ => {
            return Err(LoadError::NotAnImage {
                path: path.to_path_buf(),
            })
        }
    };

    let data: Vec<f32> = hdu.read_image(&mut file).map_err(|source| LoadError::Fits {
        path: path.to_path_buf(),
        source,
    })?;
    let pixels =
        Array2::from_shape_vec(shape, data).map_err(|_| LoadError::NotAnImage {
            path: path.to_path_buf(),
        })?;

    let exposure = read_keyword(&mut file, path, "EXPTIME")?;
    let timestamp = read_timestamp(&mut file, path)?;
    let crval1: f64 = read_keyword(&mut file, path, "CRVAL1")?;
    let crval2: f64 = read_keyword(&mut file, path, "CRVAL2")?;
    let crpix1: f64 = read_keyword(&mut file, path, "CRPIX1")?;
    let crpix2: f64 = read_keyword(&mut file, path, "CRPIX2")?;
    let cdelt1: f64 = read_keyword(&mut file, path, "CDELT1")?;
    let cdelt2: f64 = read_keyword(&mut file, path, "CDELT2")?;
    // Field rotation is optional and defaults to none.
    let crota2 = read_keyword(&mut file, path, "CROTA2").unwrap_or(0.0);

    Ok(FrameImage::new(
        pixels,
        timestamp,
        exposure,
        EquatorialPoint::new(crval1.to_radians(), crval2.to_radians()),
        GridPoint::new(crpix1.round() as i64 - 1, crpix2.round() as i64 - 1),
        cdelt1.to_radians(),
        cdelt2.to_radians(),
        crota2.to_radians(),
    ))
}

/// Exposure start as a Julian day, from JD or MJD-OBS.
fn read_timestamp(file: &mut FitsFile, path: &Path) -> Result<f64, LoadError> {
    if let Ok(jd) = read_keyword(file, path, "JD") {
        return Ok(jd);
    }
    read_keyword(file, path, "MJD-OBS").map(|mjd| mjd + MJD_OFFSET)
}

fn read_keyword(file: &mut FitsFile, path: &Path, keyword: &str) -> Result<f64, LoadError> {
    let hdu = file.primary_hdu().map_err(|source| LoadError::Fits {
        path: path.to_path_buf(),
        source,
    })?;
    hdu.read_key::<f64>(file, keyword)
        .map_err(|_| LoadError::MissingKeyword {
            path: path.to_path_buf(),
            keyword: keyword.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn test_plate_scale_conversion() {
        // One arcsec per pixel each axis, opposite signs as a real WCS has.
        let arcsec_rad = (1.0f64 / 3600.0).to_radians();
        let frame = FrameImage::new(
            Array2::zeros((10, 10)),
            2_460_000.5,
            60.0,
            EquatorialPoint::new(0.0, 0.0),
            GridPoint::new(5, 5),
            -arcsec_rad,
            arcsec_rad,
            0.0,
        );
        assert_relative_eq!(plate_scale_arcsec(&frame), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_wrong_group_count_rejected() {
        let paths = vec![vec![PathBuf::from("a.fits")], vec![PathBuf::from("b.fits")]];
        assert!(matches!(
            load_groups(&paths),
            Err(RunError::GroupCount(2))
        ));
    }

    #[test]
    fn test_group_of_unreadable_frames_is_empty() {
        let paths = vec![
            vec![PathBuf::from("/nonexistent/a.fits")],
            vec![PathBuf::from("/nonexistent/b.fits")],
            vec![PathBuf::from("/nonexistent/c.fits")],
        ];
        assert!(matches!(load_groups(&paths), Err(RunError::EmptyGroup(0))));
    }
}
