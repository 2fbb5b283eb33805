//! Work queues and the jobs that run on them.

pub mod ocr;
pub mod work;
