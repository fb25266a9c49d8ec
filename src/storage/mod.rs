/*! Specialized containers.

The `storage` module provides containers for use in other modules.
The containers support both pre-allocated memory, without the `std`
or `alloc` crates being available, and heap-allocated memory.
*/

mod assembler;
mod ring_buffer;

pub use self::assembler::{Assembler, Block, TooManyHolesError};
pub use self::ring_buffer::RingBuffer;
