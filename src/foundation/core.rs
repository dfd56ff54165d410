use crate::foundation::error::{DriverError, DriverResult};

/// Browser viewport in CSS pixels. Fixes the resolution of the exported video.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const FULL_HD: Self = Self {
        width: 1920,
        height: 1080,
    };

    pub fn new(width: u32, height: u32) -> DriverResult<Self> {
        let v = Self { width, height };
        v.validate()?;
        Ok(v)
    }

    pub fn validate(self) -> DriverResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(DriverError::validation("viewport width/height must be > 0"));
        }
        Ok(())
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::FULL_HD
    }
}

impl std::fmt::Display for Viewport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Handle for a page opened through a browser driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PageId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_rejects_zero_dimensions() {
        assert!(Viewport::new(0, 1080).is_err());
        assert!(Viewport::new(1920, 0).is_err());
        assert_eq!(Viewport::new(1920, 1080).unwrap(), Viewport::FULL_HD);
    }

    #[test]
    fn viewport_displays_as_resolution() {
        assert_eq!(Viewport::default().to_string(), "1920x1080");
    }
}
