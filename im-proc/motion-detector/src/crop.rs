use serde::{Deserialize, Serialize};

use crate::{Error, Region, Result};

/// Requested cropping and scaling of recorded clips.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct CropSpec {
    /// Crop to exactly this region.
    pub explicit: Option<Region>,
    /// Crop to the region of interest grown by this many pixels on each side.
    /// Ignored when `explicit` is set or when there is no region of interest.
    pub padding: Option<u32>,
    /// Scale the cropped image to this size.
    pub scale: Option<(u32, u32)>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropOrigin {
    Explicit,
    PaddedRoi,
    FullFrame,
}

/// The resolved output geometry of recorded clips.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct OutputGeometry {
    pub crop: Region,
    pub scale: Option<(u32, u32)>,
    pub origin: CropOrigin,
}

impl OutputGeometry {
    /// Width and height of the frames in the recorded file.
    pub fn output_size(&self) -> (u32, u32) {
        self.scale
            .unwrap_or((self.crop.width, self.crop.height))
    }
}

/// Resolves a [CropSpec] against the source frame size.
///
/// All resolved dimensions and offsets are even so that the result can be
/// encoded with 4:2:0 chroma subsampling.
#[derive(Debug, Clone, Copy)]
pub struct CropTransform {
    frame_width: u32,
    frame_height: u32,
}

impl CropTransform {
    pub fn new(frame_width: u32, frame_height: u32) -> Self {
        Self {
            frame_width,
            frame_height,
        }
    }

    /// Explicit crop wins, then the padded region of interest, then the full
    /// frame.
    pub fn resolve(&self, spec: &CropSpec, roi: Option<&Region>) -> Result<OutputGeometry> {
        let (crop, origin) = if let Some(explicit) = &spec.explicit {
            explicit.validate(self.frame_width, self.frame_height)?;
            (*explicit, CropOrigin::Explicit)
        } else if let (Some(padding), Some(roi)) = (spec.padding, roi) {
            roi.validate(self.frame_width, self.frame_height)?;
            (self.pad(roi, padding), CropOrigin::PaddedRoi)
        } else {
            (
                Region::full(self.frame_width, self.frame_height),
                CropOrigin::FullFrame,
            )
        };
        let crop = even_aligned(crop)?;

        let scale = match spec.scale {
            None => None,
            Some((w, h)) => {
                let (w, h) = (w & !1, h & !1);
                if w == 0 || h == 0 {
                    return Err(Error::InvalidScale(w, h));
                }
                Some((w, h))
            }
        };
        Ok(OutputGeometry {
            crop,
            scale,
            origin,
        })
    }

    fn pad(&self, roi: &Region, padding: u32) -> Region {
        let x0 = roi.x.saturating_sub(padding);
        let y0 = roi.y.saturating_sub(padding);
        let x1 = (roi.right() + padding as u64).min(self.frame_width as u64) as u32;
        let y1 = (roi.bottom() + padding as u64).min(self.frame_height as u64) as u32;
        Region::new(x0, y0, x1 - x0, y1 - y0)
    }
}

fn even_aligned(r: Region) -> Result<Region> {
    // Moving the origin down and shrinking the size keeps the region inside
    // the frame.
    let aligned = Region::new(r.x & !1, r.y & !1, r.width & !1, r.height & !1);
    if aligned.width == 0 || aligned.height == 0 {
        return Err(Error::EmptyRegion(r));
    }
    Ok(aligned)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_frame_by_default() {
        let t = CropTransform::new(1280, 720);
        let g = t.resolve(&CropSpec::default(), None).unwrap();
        assert_eq!(g.crop, Region::full(1280, 720));
        assert_eq!(g.origin, CropOrigin::FullFrame);
        assert_eq!(g.output_size(), (1280, 720));

        // padding without a region of interest falls back to the full frame
        let spec = CropSpec {
            padding: Some(20),
            ..Default::default()
        };
        assert_eq!(t.resolve(&spec, None).unwrap().origin, CropOrigin::FullFrame);
    }

    #[test]
    fn explicit_wins_over_roi() {
        let t = CropTransform::new(1280, 720);
        let spec = CropSpec {
            explicit: Some(Region::new(100, 50, 640, 360)),
            padding: Some(10),
            scale: None,
        };
        let roi = Region::new(0, 0, 10, 10);
        let g = t.resolve(&spec, Some(&roi)).unwrap();
        assert_eq!(g.crop, Region::new(100, 50, 640, 360));
        assert_eq!(g.origin, CropOrigin::Explicit);
    }

    #[test]
    fn explicit_out_of_frame_is_rejected() {
        let t = CropTransform::new(640, 480);
        let spec = CropSpec {
            explicit: Some(Region::new(600, 0, 100, 100)),
            ..Default::default()
        };
        assert!(matches!(
            t.resolve(&spec, None),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn padded_roi_is_clamped_to_frame() {
        let t = CropTransform::new(640, 480);
        let spec = CropSpec {
            padding: Some(50),
            ..Default::default()
        };
        let roi = Region::new(20, 400, 100, 60);
        let g = t.resolve(&spec, Some(&roi)).unwrap();
        assert_eq!(g.origin, CropOrigin::PaddedRoi);
        assert_eq!(g.crop, Region::new(0, 350, 170, 130));
        assert!(g.crop.validate(640, 480).is_ok());
    }

    #[test]
    fn odd_values_are_made_even() {
        let t = CropTransform::new(641, 481);
        let g = t.resolve(&CropSpec::default(), None).unwrap();
        assert_eq!(g.crop, Region::full(640, 480));

        let spec = CropSpec {
            explicit: Some(Region::new(3, 5, 101, 99)),
            scale: Some((321, 241)),
            ..Default::default()
        };
        let g = t.resolve(&spec, None).unwrap();
        assert_eq!(g.crop, Region::new(2, 4, 100, 98));
        assert_eq!(g.output_size(), (320, 240));
    }

    #[test]
    fn degenerate_sizes_are_rejected() {
        let t = CropTransform::new(640, 480);
        let spec = CropSpec {
            explicit: Some(Region::new(0, 0, 1, 100)),
            ..Default::default()
        };
        assert!(t.resolve(&spec, None).is_err());
        let spec = CropSpec {
            scale: Some((1, 100)),
            ..Default::default()
        };
        assert!(matches!(
            t.resolve(&spec, None),
            Err(Error::InvalidScale(..))
        ));
    }
}
