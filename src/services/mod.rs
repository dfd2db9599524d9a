pub mod buckets;
pub mod db;
pub mod embedding;
pub mod enrichment;
pub mod listing;
pub mod storage_service;
pub mod vector_index;
