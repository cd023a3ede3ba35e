//! Row structs, DTOs and status lookups.

pub mod segmentation_task;
pub mod status;
