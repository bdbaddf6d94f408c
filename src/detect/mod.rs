mod classify;
mod result;

pub use classify::{classify, class_for_id, class_for_label, COCO_PERSON, COCO_VEHICLES};
pub use result::{ClassCategory, ClassKey, Detection, RawDetection};
