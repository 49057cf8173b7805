//! Export settings and the fingerprint used to validate resumes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ExportError;

const MM_PER_INCH: f64 = 25.4;
const POINTS_PER_INCH: f64 = 72.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageUnit {
    Mm,
    In,
}

impl PageUnit {
    fn to_inches(self, value: f64) -> f64 {
        match self {
            PageUnit::Mm => value / MM_PER_INCH,
            PageUnit::In => value,
        }
    }
}

/// Cut guide drawing style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuideStyle {
    None,
    Corners,
    FullLines,
}

impl fmt::Display for GuideStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuideStyle::None => write!(f, "none"),
            GuideStyle::Corners => write!(f, "corners"),
            GuideStyle::FullLines => write!(f, "full_lines"),
        }
    }
}

/// Settings for one export run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSettings {
    /// Prefix of the delivered filename.
    pub product_name: String,
    pub page_width: f64,
    pub page_height: f64,
    pub page_unit: PageUnit,
    pub columns: u32,
    pub rows: u32,
    pub dpi: u32,
    pub bleed_mm: f64,
    pub spacing_mm: f64,
    pub offset_x_mm: f64,
    pub offset_y_mm: f64,
    pub guide_style: GuideStyle,
    pub guide_width_px: f64,
    pub darken: bool,
    pub jpeg_quality: u8,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            product_name: "cardsheet".to_string(),
            page_width: 8.5,
            page_height: 11.0,
            page_unit: PageUnit::In,
            columns: 3,
            rows: 3,
            dpi: 300,
            bleed_mm: 0.0,
            spacing_mm: 0.0,
            offset_x_mm: 0.0,
            offset_y_mm: 0.0,
            guide_style: GuideStyle::Corners,
            guide_width_px: 2.0,
            darken: false,
            jpeg_quality: 90,
        }
    }
}

impl ExportSettings {
    /// Rejects settings that cannot produce a page.
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.columns == 0 || self.rows == 0 {
            return Err(ExportError::InvalidRequest(format!(
                "grid must have at least one cell, got {}x{}",
                self.columns, self.rows
            )));
        }
        if self.dpi == 0 {
            return Err(ExportError::InvalidRequest("dpi must be positive".to_string()));
        }
        if !(self.page_width > 0.0 && self.page_height > 0.0) {
            return Err(ExportError::InvalidRequest(format!(
                "invalid page size: {}x{}",
                self.page_width, self.page_height
            )));
        }
        Ok(())
    }

    pub fn cards_per_page(&self) -> usize {
        self.columns as usize * self.rows as usize
    }

    /// Physical page size in inches.
    pub fn page_size_in(&self) -> (f64, f64) {
        (
            self.page_unit.to_inches(self.page_width),
            self.page_unit.to_inches(self.page_height),
        )
    }

    /// Page size in PDF points, used for the MediaBox of every page.
    pub fn page_size_pt(&self) -> (f64, f64) {
        let (w, h) = self.page_size_in();
        (w * POINTS_PER_INCH, h * POINTS_PER_INCH)
    }

    /// Rendered page bitmap size in pixels at the configured DPI.
    pub fn page_size_px(&self) -> (u32, u32) {
        let (w, h) = self.page_size_in();
        let dpi = f64::from(self.dpi);
        ((w * dpi).round() as u32, (h * dpi).round() as u32)
    }

    /// Millimeters to pixels at the configured DPI.
    pub fn mm_to_px(&self, mm: f64) -> f64 {
        mm / MM_PER_INCH * f64::from(self.dpi)
    }

    pub fn fingerprint(&self) -> SettingsFingerprint {
        SettingsFingerprint {
            page_width: self.page_width,
            page_height: self.page_height,
            page_unit: self.page_unit,
            dpi: self.dpi,
            bleed_mm: self.bleed_mm,
            columns: self.columns,
            rows: self.rows,
            spacing_mm: self.spacing_mm,
            offset_x_mm: self.offset_x_mm,
            offset_y_mm: self.offset_y_mm,
            guide_style: self.guide_style,
            guide_width_px: self.guide_width_px,
            darken: self.darken,
        }
    }
}

/// The settings that must match for a stored session to be resumed.
///
/// This is a fixed field list: `product_name` and `jpeg_quality` may differ
/// between a stored session and a resumed run without being detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsFingerprint {
    pub page_width: f64,
    pub page_height: f64,
    pub page_unit: PageUnit,
    pub dpi: u32,
    pub bleed_mm: f64,
    pub columns: u32,
    pub rows: u32,
    pub spacing_mm: f64,
    pub offset_x_mm: f64,
    pub offset_y_mm: f64,
    pub guide_style: GuideStyle,
    pub guide_width_px: f64,
    pub darken: bool,
}
