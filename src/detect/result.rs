use serde::Serialize;

use crate::region::BoundingBox;

/// Semantic grouping a detection is counted under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ClassCategory {
    Person,
    Vehicle,
    Other,
}

/// Class identity as delivered by the inference engine.
///
/// Engines differ in what they attach: some give a numeric COCO id, some only
/// a text label, some both. `Missing` covers metadata that could not be read.
#[derive(Clone, Debug, PartialEq)]
pub enum ClassKey {
    Id(i64),
    Label(String),
    IdAndLabel(i64, String),
    Missing,
}

/// Detection as received from the engine, before classification.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub key: ClassKey,
    pub confidence: f64,
    /// Normalized [0, 1] coordinates.
    pub bbox: BoundingBox,
}

impl RawDetection {
    pub fn new(key: ClassKey, confidence: f64, bbox: BoundingBox) -> Self {
        Self {
            key,
            confidence,
            bbox,
        }
    }

    pub fn with_id(class_id: i64, confidence: f64, bbox: BoundingBox) -> Self {
        Self::new(ClassKey::Id(class_id), confidence, bbox)
    }

    pub fn with_label(label: impl Into<String>, confidence: f64, bbox: BoundingBox) -> Self {
        Self::new(ClassKey::Label(label.into()), confidence, bbox)
    }
}

/// A classified detection. Lives only for the frame being scored.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub category: ClassCategory,
    pub confidence: f64,
    pub bbox: BoundingBox,
}
