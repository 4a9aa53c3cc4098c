use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Annotated object in absolute image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthBox {
    /// `[x1, y1, x2, y2]` in pixels.
    pub bbox: [f32; 4],
    /// Zero-based object class. Background is not a valid label here; the
    /// classification head reserves index 0 for it internally.
    #[serde(default)]
    pub label: usize,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("bbox invalid order or non-finite: {0:?}")]
    InvalidBbox([f32; 4]),
    #[error("bbox {bbox:?} lies outside the {width}x{height} image")]
    OutOfBounds {
        bbox: [f32; 4],
        width: usize,
        height: usize,
    },
    #[error("label {label} out of range for {num_classes} classes")]
    InvalidLabel { label: usize, num_classes: usize },
}

impl GroundTruthBox {
    pub fn new(bbox: [f32; 4], label: usize) -> Self {
        Self { bbox, label }
    }

    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let b = self.bbox;
        if b.iter().any(|v| !v.is_finite()) || b[0] > b[2] || b[1] > b[3] {
            return Err(ValidationError::InvalidBbox(b));
        }
        Ok(())
    }

    /// Full check against the image the box annotates and the class count.
    pub fn validate_for(
        &self,
        image_shape: (usize, usize),
        num_classes: usize,
    ) -> Result<(), ValidationError> {
        self.validate()?;
        let (height, width) = image_shape;
        let b = self.bbox;
        if b[0] < 0.0 || b[1] < 0.0 || b[2] > width as f32 || b[3] > height as f32 {
            return Err(ValidationError::OutOfBounds {
                bbox: b,
                width,
                height,
            });
        }
        if self.label >= num_classes {
            return Err(ValidationError::InvalidLabel {
                label: self.label,
                num_classes,
            });
        }
        Ok(())
    }
}

/// Validate a whole annotation list, stopping at the first bad box.
pub fn validate_all(
    boxes: &[GroundTruthBox],
    image_shape: (usize, usize),
    num_classes: usize,
) -> Result<(), ValidationError> {
    for b in boxes {
        b.validate_for(image_shape, num_classes)?;
    }
    Ok(())
}
