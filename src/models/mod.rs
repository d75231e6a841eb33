pub mod defect;
pub mod ingest;
pub mod job;
pub mod result;
