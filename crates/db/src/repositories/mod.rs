//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument.

pub mod segmentation_task_repo;

pub use segmentation_task_repo::SegmentationTaskRepo;
