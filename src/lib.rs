//! This crate implements the TLSF (Two-Level Segregated Fit) dynamic
//! allocation algorithm¹ over a caller-provided contiguous region, with a
//! twist: the region does not have to be memory.
//!
//!  - **Allocation and deallocation operations are guaranteed to complete
//!    in constant time**, with bounded fragmentation. TLSF is suitable for
//!    real-time applications.
//!
//!  - **Two header placement modes, fixed at construction.** In *internal*
//!    mode, block headers are stored inline at the start of each block and
//!    [`Tlsf::alloc`] returns a usable-bytes pointer, like a conventional
//!    allocator. In *external* mode the managed range is never accessed:
//!    headers live on the heap and carry the managed address explicitly, so
//!    the allocator can parcel out arbitrary integer-addressable resources
//!    such as device memory or address space.
//!
//!  - **This crate supports `#![no_std]`.** It only needs `alloc` (and only
//!    in external mode, for the externalized headers).
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new
//! dynamic memory allocator for real-time systems," *Proceedings. 16th
//! Euromicro Conference on Real-Time Systems*, 2004. ECRTS 2004., Catania,
//! Italy, 2004, pp. 79-88, doi: 10.1109/EMRTS.2004.1311009.</sub>
//!
//! # Examples
//!
//! ## Internal mode
//!
//! ```rust
//! use xtlsf::Tlsf;
//!
//! let mut pool = [0u64; 1024];
//! let (base, size) = (pool.as_mut_ptr() as usize, 8192);
//!
//! // Safety: `pool` is valid, word-aligned memory outliving `tlsf`.
//! let mut tlsf = unsafe { Tlsf::create(base, size, false) }.unwrap();
//!
//! let ptr = tlsf.alloc(100).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0x5a, 100);
//!     tlsf.free(ptr);
//! }
//! ```
//!
//! ## External mode
//!
//! ```rust
//! use xtlsf::Tlsf;
//!
//! // Manage an opaque range; nothing in it is ever dereferenced.
//! let mut tlsf = unsafe { Tlsf::create(0x4000_0000, 1 << 20, true) }.unwrap();
//!
//! let blk = tlsf.ext_alloc(100).unwrap();
//! let (addr, len) = unsafe { tlsf.ext_getaddr(blk) };
//! assert!(addr >= 0x4000_0000 && len >= 100);
//! unsafe { tlsf.ext_free(blk) };
//! ```
#![no_std]

extern crate alloc;

mod tlsf;
mod utils;
pub use self::tlsf::{BlockHandle, Tlsf, GRANULARITY};

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests;
