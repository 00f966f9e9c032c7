//! Value types describing tensor extents and how they are spread over tiles.

mod tensor_shape;
pub use tensor_shape::*;
mod distribution;
pub use distribution::*;
mod distributed;
pub use distributed::*;
mod tile_mapping;
pub use tile_mapping::*;
