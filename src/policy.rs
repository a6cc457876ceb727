use serde::{Deserialize, Serialize};

/// Named output presets, ordered from lowest to highest fidelity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityTier {
    Screen,
    Ebook,
    Printer,
    Prepress,
}

impl QualityTier {
    /// Ghostscript `-dPDFSETTINGS` name.
    pub fn preset(self) -> &'static str {
        match self {
            QualityTier::Screen => "/screen",
            QualityTier::Ebook => "/ebook",
            QualityTier::Printer => "/printer",
            QualityTier::Prepress => "/prepress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualitySettings {
    pub quality: u8,
    pub tier: QualityTier,
    /// Target raster resolution for downsampled images.
    pub dpi: u32,
}

/// Maps the caller's 0..=100 quality onto engine settings.
///
/// Every field is non-decreasing in `quality`. Values above 100 are clamped;
/// the pipeline rejects them before this is reached.
pub fn settings_for(quality: u8) -> QualitySettings {
    let q = quality.min(100);
    let (tier, dpi) = match q {
        0..=24 => (QualityTier::Screen, 72),
        25..=49 => (QualityTier::Ebook, 100),
        50..=74 => (QualityTier::Ebook, 150),
        75..=89 => (QualityTier::Printer, 200),
        _ => (QualityTier::Prepress, 300),
    };
    QualitySettings {
        quality: q,
        tier,
        dpi,
    }
}
