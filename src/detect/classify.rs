//! Class resolution for raw detections.
//!
//! Resolution is two-step: the numeric COCO id first, then the text label.
//! Every way of failing is an explicit branch returning `None`.

use super::result::{ClassCategory, ClassKey, RawDetection};

pub const COCO_PERSON: i64 = 0;
/// car, motorcycle, bus, truck
pub const COCO_VEHICLES: [i64; 4] = [2, 3, 5, 7];

/// Map a numeric class id. Ids outside the person/vehicle set return `None`.
pub fn class_for_id(class_id: i64) -> Option<ClassCategory> {
    match class_id {
        COCO_PERSON => Some(ClassCategory::Person),
        id if COCO_VEHICLES.contains(&id) => Some(ClassCategory::Vehicle),
        _ => None,
    }
}

/// Case-insensitive label lookup. Unknown labels return `None`.
pub fn class_for_label(label: &str) -> Option<ClassCategory> {
    let label = label.trim();
    if let Ok(class_id) = label.parse::<i64>() {
        return class_for_id(class_id);
    }
    match label.to_ascii_lowercase().as_str() {
        "person" => Some(ClassCategory::Person),
        "car" | "automobile" | "motorcycle" | "motorbike" | "bus" | "truck" | "lorry" => {
            Some(ClassCategory::Vehicle)
        }
        _ => None,
    }
}

/// Resolve the category of a raw detection.
///
/// - a mapped id wins;
/// - an unmapped id falls back to the label when one is present;
/// - an unmapped id with no usable label is `Other` (seen, not counted);
/// - an unknown label alone, or no class information, is `None`.
pub fn classify(raw: &RawDetection) -> Option<ClassCategory> {
    match &raw.key {
        ClassKey::Id(class_id) => Some(class_for_id(*class_id).unwrap_or(ClassCategory::Other)),
        ClassKey::IdAndLabel(class_id, label) => class_for_id(*class_id)
            .or_else(|| class_for_label(label))
            .or(Some(ClassCategory::Other)),
        ClassKey::Label(label) => class_for_label(label),
        ClassKey::Missing => None,
    }
}
