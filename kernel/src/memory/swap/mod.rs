pub mod bitmap;
pub mod evict;
pub mod map;
