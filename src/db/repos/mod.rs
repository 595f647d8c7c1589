pub mod sessions;
pub mod vector_collections;
