use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// An axis-aligned rectangle in pixel coordinates.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole frame.
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// One past the rightmost column.
    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// One past the bottom row.
    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn is_full_frame(&self, frame_width: u32, frame_height: u32) -> bool {
        *self == Self::full(frame_width, frame_height)
    }

    /// Check that the region is non-empty and lies within the frame.
    pub fn validate(&self, frame_width: u32, frame_height: u32) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::EmptyRegion(*self));
        }
        if self.right() > frame_width as u64 || self.bottom() > frame_height as u64 {
            return Err(Error::OutOfBounds {
                region: *self,
                frame_width,
                frame_height,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}:{}", self.x, self.y, self.width, self.height)
    }
}

impl std::str::FromStr for Region {
    type Err = Error;

    /// Parse `X:Y:W:H`. Commas are accepted in place of colons.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split([':', ',']).map(str::trim).collect();
        let [x, y, w, h] = parts.as_slice() else {
            return Err(Error::ParseRegion(s.to_string()));
        };
        let num = |v: &str| -> Result<u32> {
            v.parse()
                .map_err(|_| Error::ParseRegion(s.to_string()))
        };
        Ok(Region::new(num(x)?, num(y)?, num(w)?, num(h)?))
    }
}
