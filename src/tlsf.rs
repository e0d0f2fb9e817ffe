//! The TLSF allocator core.
use core::{fmt, hint::unreachable_unchecked, mem, ptr::NonNull};

use alloc::alloc::{alloc as heap_alloc, dealloc as heap_dealloc, Layout};

use crate::utils::{ffs, fls, ilog2, roundup2};

/// The allocation granularity and minimum block size.
///
/// Requested sizes are rounded up to a multiple of this value before a size
/// class is chosen.
pub const GRANULARITY: usize = 32;

/// The number of second-level subdivisions, as an exponent of two.
/// `1 << SLI_SHIFT = 32` subdivisions per first-level class.
const SLI_SHIFT: u32 = 5;

/// The number of second-level classes per first-level class.
const SLLEN: usize = 1 << SLI_SHIFT;

/// The number of first-level classes. One per bit of a machine word; the
/// rows below `log2(GRANULARITY)` are simply never occupied.
const FLLEN: usize = usize::BITS as usize;

/// The bit of [`BlockHdr::len`] marking the block as free. Block lengths are
/// multiples of the word size, so the low bit is available for the flag.
const LEN_FREE: usize = 0b1;

/// The in-region header footprint of a block in internal mode. The
/// segregation list links of [`FreeBlockHdr`] overlap the payload and are
/// live only while the block is free, so they don't count.
const BLKHDR_LEN: usize = mem::size_of::<BlockHdr>();

/// The resident header of a block: its payload length and the mode-specific
/// neighbour word.
///
/// The `len` field stores the payload length, which excludes any header
/// storage, with [`LEN_FREE`] packed into bit 0.
#[repr(C)]
struct BlockHdr {
    len: usize,
    link: HdrLink,
}

/// The mode-specific neighbour word of a block header.
#[derive(Clone, Copy)]
#[repr(C)]
union HdrLink {
    /// Internal mode: the previous physical block, or `None` at the start of
    /// the managed region. The next physical block is derived from `len`.
    prev_phys: Option<NonNull<BlockHdr>>,
    /// External mode: the managed address this block represents.
    addr: usize,
}

/// The header of a free block: the resident header followed by the
/// segregation list links.
///
/// In internal mode this struct is laid over the first
/// `size_of::<FreeBlockHdr>() ≤ GRANULARITY` bytes of the block, so the
/// links borrow payload space that no caller currently owns.
#[repr(C)]
struct FreeBlockHdr {
    common: BlockHdr,
    next_free: Option<NonNull<FreeBlockHdr>>,
    prev_free: Option<NonNull<FreeBlockHdr>>,
}

/// The externally allocated header of external mode. Lives on the heap and
/// is a member of the physical block chain, a doubly-linked list in managed
/// address order.
#[repr(C)]
struct ExtBlockHdr {
    hdr: FreeBlockHdr,
    chain_next: Option<NonNull<ExtBlockHdr>>,
    chain_prev: Option<NonNull<ExtBlockHdr>>,
}

/// An opaque handle to a block allocated from an external-mode [`Tlsf`].
///
/// Obtained from [`Tlsf::ext_alloc`] and surrendered to [`Tlsf::ext_free`].
/// The managed address range it stands for is retrieved with
/// [`Tlsf::ext_getaddr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle(NonNull<BlockHdr>);

#[cfg_attr(doc, svgbobdoc::transform)]
/// A two-level segregated fit allocator over a contiguous region of memory
/// or of any other integer-addressable resource.
///
/// Allocation and deallocation complete in constant time. The allocator
/// operates in one of two header placement modes, fixed at construction:
///
///  - *Internal*: block headers are placed at the start of each block inside
///    the managed region, which therefore must be directly addressable
///    memory. [`Tlsf::alloc`] returns a pointer to the usable bytes
///    immediately after the header.
///
///  - *External*: the managed region is opaque and never accessed; headers
///    are obtained from the global allocator and carry the managed address
///    explicitly. [`Tlsf::ext_alloc`] returns a [`BlockHandle`].
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///   First level
///                               ,-----+-----+-----+-----+-----+-----,
///          "fl_bitmap: 1 word"= | ... |  0  |  1  |  0  |  0  |  0  |
///                               +-----+-----+-----+-----+-----+-----+
///                      min size | ... |  2⁹ |  2⁸ |  2⁷ |  2⁶ |  2⁵ |
///                               '-----+-----+--+--+-----+-----+-----'
///                                              |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Second level                               v
///                                  ,-----+-----+-----+-----+-----,
///      "sl_bitmap[8]: 1 word" =    | ... |  1  |  0  | ... |  0  |
///                                  +-----+-----+-----+-----+-----+
///            min size 2⁸(1+n/32)   | ... |  29 |  28 | ... |  0  |
///                                  +-----+-----+-----+-----+-----+
///                       first_free | ... |  O  |     |     |     |
///                                  '-----+--|--+-----+-----+-----'
///                                           |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Free blocks                             |
///             ,-----------------------------'
///             | ,---+---+-------,    ,---+---+-------,
///             '-+>O | O-+-------+----+>O |   |       |
///               +---+---'       |    +---+---'       |
///               |               |    |               |
///               '---------------'    '---------------'
///                   488 bytes            480 bytes
/// ```
/// </center>
///
/// The free blocks of every size class are reachable through one
/// first-level bitmap word, one second-level bitmap word and one list head,
/// which is what bounds every operation to a constant number of steps.
pub struct Tlsf {
    /// The managed region's start address.
    base: usize,
    /// The managed region's total length.
    size: usize,
    /// Running sum of the lengths of all currently free blocks.
    free: usize,
    /// `BLKHDR_LEN` in internal mode, zero in external mode. Doubles as the
    /// mode discriminant.
    blk_hdr_len: usize,
    /// External mode: the physical block chain, in managed address order.
    /// The head is the block at `base`. Empty and unused in internal mode.
    ext_chain: Option<NonNull<ExtBlockHdr>>,
    /// Bit `fl` is set iff `sl_bitmap[fl]` is non-zero.
    fl_bitmap: usize,
    /// Bit `sl` of `sl_bitmap[fl]` is set iff `first_free[fl][sl]` is
    /// non-empty.
    sl_bitmap: [usize; FLLEN],
    /// The heads of the per-class free block lists.
    first_free: [[Option<NonNull<FreeBlockHdr>>; SLLEN]; FLLEN],
}

// Safety: All block headers directly or indirectly referenced by a
//         particular instance of `Tlsf` are logically owned by that `Tlsf`
//         and have no interior mutability, so these are safe.
unsafe impl Send for Tlsf {}
unsafe impl Sync for Tlsf {}

impl BlockHdr {
    /// The payload length, without the flag bit.
    #[inline]
    fn length(&self) -> usize {
        self.len & !LEN_FREE
    }

    #[inline]
    fn is_free(&self) -> bool {
        (self.len & LEN_FREE) != 0
    }
}

impl Tlsf {
    /// Construct an allocator managing the `size`-byte (or `size`-unit)
    /// region starting at `base`.
    ///
    /// `size` is rounded down to a multiple of [`GRANULARITY`]. After
    /// rounding it must leave room for at least one block
    /// (`GRANULARITY + 2 * size_of::<usize>()` bytes in internal mode,
    /// `GRANULARITY` units in external mode); `None` is returned otherwise,
    /// or when header storage cannot be obtained in external mode.
    ///
    /// If `exthdr` is true, block headers are externalized and allocations
    /// can be made only through [`Self::ext_alloc`] and [`Self::ext_free`].
    /// The allocator never accesses the managed region in this mode.
    ///
    /// If `exthdr` is false, the region is treated as accessible memory and
    /// block headers are placed inline at the start of each block.
    ///
    /// # Safety
    ///
    /// When `exthdr` is false, `base..base + size` must denote memory that
    /// is valid for reads and writes, aligned to the machine word size, and
    /// unaliased for the whole lifetime of the returned allocator.
    ///
    /// When `exthdr` is true, there is no requirement on `base`; the range
    /// is treated as opaque.
    pub unsafe fn create(base: usize, size: usize, exthdr: bool) -> Option<Tlsf> {
        // Round down so that the managed length is granularity-aligned.
        let size = size & !(GRANULARITY - 1);

        let mut tlsf = Tlsf {
            base,
            size,
            free: 0,
            blk_hdr_len: if exthdr { 0 } else { BLKHDR_LEN },
            ext_chain: None,
            fl_bitmap: 0,
            sl_bitmap: [0; FLLEN],
            first_free: [[None; SLLEN]; FLLEN],
        };

        if size < GRANULARITY + tlsf.blk_hdr_len {
            return None;
        }

        // The initial block spans the whole region.
        let blk = if exthdr {
            let ext = Self::ext_hdr_new(base, size)?;
            tlsf.chain_insert_head(ext);
            ext.cast::<BlockHdr>()
        } else {
            let blk = NonNull::new(base as *mut FreeBlockHdr)?;
            (*blk.as_ptr()).common = BlockHdr {
                len: size - BLKHDR_LEN,
                link: HdrLink { prev_phys: None },
            };
            blk.cast::<BlockHdr>()
        };
        tlsf.insert_block(blk);

        Some(tlsf)
    }

    /// Attempt to allocate `size` bytes. Internal mode only.
    ///
    /// Returns a machine-word-aligned pointer to the usable bytes on
    /// success, `None` if no block can satisfy the request. A request of
    /// size 0 is treated as size 1.
    ///
    /// # Time Complexity
    ///
    /// This method completes in constant time.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        debug_assert_eq!(self.blk_hdr_len, BLKHDR_LEN);

        // Safety: the whole managed region is dereferenceable in internal
        //         mode per `create`'s contract.
        unsafe {
            let blk = self.alloc_block(size)?;
            let ptr = (blk.as_ptr() as *mut u8).add(BLKHDR_LEN);
            debug_assert_eq!(ptr as usize % mem::align_of::<usize>(), 0);
            Some(NonNull::new_unchecked(ptr))
        }
    }

    /// Deallocate a block previously allocated with [`Self::alloc`].
    ///
    /// # Time Complexity
    ///
    /// This method completes in constant time.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `self.alloc` and not freed since.
    /// The caller must not access the block after this call.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        debug_assert_eq!(self.blk_hdr_len, BLKHDR_LEN);

        let blk = NonNull::new_unchecked(ptr.as_ptr().sub(BLKHDR_LEN) as *mut BlockHdr);
        self.free_block(blk);
    }

    /// Attempt to allocate `size` units of the managed region. External
    /// mode only.
    ///
    /// Returns a handle on success, `None` if no block can satisfy the
    /// request or header storage cannot be obtained. A request of size 0 is
    /// treated as size 1.
    ///
    /// The returned block may be larger than requested: besides the usual
    /// size class rounding, a split abandoned because header storage ran
    /// out hands the caller the whole unsplit block.
    ///
    /// # Time Complexity
    ///
    /// This method completes in constant time, not counting the single
    /// header allocation a split performs.
    pub fn ext_alloc(&mut self, size: usize) -> Option<BlockHandle> {
        debug_assert_eq!(self.blk_hdr_len, 0);

        // Safety: external mode never dereferences the managed region; all
        //         headers touched live on the heap and are owned by `self`.
        unsafe { self.alloc_block(size).map(BlockHandle) }
    }

    /// Return a block previously allocated with [`Self::ext_alloc`].
    ///
    /// # Time Complexity
    ///
    /// This method completes in constant time.
    ///
    /// # Safety
    ///
    /// `blk` must have been returned by `self.ext_alloc` and not freed
    /// since. The handle (and any copy of it) is invalidated by this call.
    pub unsafe fn ext_free(&mut self, blk: BlockHandle) {
        debug_assert_eq!(self.blk_hdr_len, 0);

        self.free_block(blk.0);
    }

    /// Get the managed address and the length of the block `blk` stands
    /// for. External mode only.
    ///
    /// # Safety
    ///
    /// `blk` must be a live handle obtained from `self.ext_alloc`.
    pub unsafe fn ext_getaddr(&self, blk: BlockHandle) -> (usize, usize) {
        debug_assert_eq!(self.blk_hdr_len, 0);

        let hdr = blk.0.as_ref();
        (hdr.link.addr, hdr.length())
    }

    /// The total unused space: the sum of the lengths of all free blocks.
    ///
    /// Not all of it is allocatable in one piece; see [`Self::avail_space`].
    #[inline]
    pub fn unused_space(&self) -> usize {
        self.free
    }

    /// The largest size for which an allocation is currently guaranteed to
    /// succeed, or 0 if no free blocks exist.
    ///
    /// This is the largest free block's length reduced to the previous size
    /// class boundary, so that the class lookup performed by an allocation
    /// of the returned size cannot select a class this block is below.
    pub fn avail_space(&self) -> usize {
        // The largest free blocks hang off the highest set first-level
        // bit's highest set second-level bit.
        let fl = match fls(self.fl_bitmap) {
            0 => return 0,
            n => (n - 1) as usize,
        };
        let sl = match fls(self.sl_bitmap[fl]) {
            0 => return 0,
            n => (n - 1) as usize,
        };

        // Safety: bitmap coherence guarantees the list is non-empty, and
        //         every listed header is owned by `self`.
        let len = unsafe {
            let blk = self.first_free[fl][sl]
                .unwrap_or_else(|| unreachable_unchecked())
                .cast::<BlockHdr>();
            debug_assert!(self.validate_blkhdr(blk));
            blk.as_ref().length()
        };
        debug_assert!(self.free >= len);

        // Reduce to the previous size class: the answer must hold for any
        // block of this class, not just the one at the head.
        let len = roundup2(len + 1, GRANULARITY) - GRANULARITY;
        (len + 1) - (1usize << (ilog2(len) - SLI_SHIFT))
    }

    /// Find the size class of a block of length `size`.
    #[inline]
    fn map_block(size: usize) -> (usize, usize) {
        debug_assert!(size >= GRANULARITY);

        // The first level is the power-of-two band; the second level is a
        // uniform subdivision of the band, read off the bits of `size`
        // right below the leading one.
        let fl = ilog2(size);
        let sl = (size ^ (1usize << fl)) >> (fl - SLI_SHIFT);

        debug_assert!((fl as usize) < FLLEN);
        debug_assert!(sl < SLLEN);
        (fl as usize, sl)
    }

    /// Allocate a block of at least `size` (0 is treated as 1), rounding
    /// the request up to [`GRANULARITY`] and then to the next size class.
    ///
    /// # Safety
    ///
    /// In internal mode the managed region must be dereferenceable.
    unsafe fn alloc_block(&mut self, size: usize) -> Option<NonNull<BlockHdr>> {
        let size = size.max(1).checked_add(GRANULARITY - 1)? & !(GRANULARITY - 1);

        // Bump the mapping input by one second-level bucket width minus
        // one, so that the chosen class's blocks are all at least `size`
        // long.
        let target = size.checked_add((1usize << (ilog2(size) - SLI_SHIFT)) - 1)?;
        let (mut fl, sl) = Self::map_block(target);

        // Fast path: a non-empty list in the same first-level class, at or
        // above the target second level.
        let mut sl_map = ffs(self.sl_bitmap[fl] & (usize::MAX << sl));
        if sl_map == 0 {
            // Slow path: the lowest non-empty first-level class strictly
            // above, then its lowest non-empty second level.
            let fl_map = if fl + 1 < FLLEN {
                ffs(self.fl_bitmap & (usize::MAX << (fl + 1)))
            } else {
                0
            };
            if fl_map == 0 {
                return None;
            }
            fl = fl_map as usize - 1;
            sl_map = ffs(self.sl_bitmap[fl]);
            debug_assert!(sl_map != 0);
        }
        let sl = sl_map as usize - 1;

        let blk = self.remove_block(None, fl, sl);
        debug_assert!(blk.as_ref().length() >= size);

        // Split if what remains can hold a block of its own.
        if blk.as_ref().len - size >= GRANULARITY + self.blk_hdr_len {
            if let Some(remblk) = self.split_block(blk, size) {
                self.insert_block(remblk);
            }
        }
        Some(blk)
    }

    /// Free a block: coalesce with whichever physical neighbours are free,
    /// then reinsert the result.
    ///
    /// # Safety
    ///
    /// `blk` must be a live allocated block owned by `self`.
    unsafe fn free_block(&mut self, mut blk: NonNull<BlockHdr>) {
        debug_assert!(!blk.as_ref().is_free()); // use-after-free guard

        let prevblk = self.prev_physblk(blk);
        let nextblk = self.next_physblk(blk);

        if let Some(prevblk) = prevblk {
            if prevblk.as_ref().is_free() {
                blk = self.merge_blocks(prevblk, blk);
            }
        }
        if let Some(nextblk) = nextblk {
            if nextblk.as_ref().is_free() {
                blk = self.merge_blocks(blk, nextblk);
            }
        }
        self.insert_block(blk);
    }

    /// Link `blk` at the head of its size class's free list, marking it
    /// free and updating both bitmap levels.
    ///
    /// # Safety
    ///
    /// `blk` must be owned by `self`, consistent with its physical
    /// neighbours, not currently on any free list, and its [`LEN_FREE`]
    /// bit must be clear.
    unsafe fn insert_block(&mut self, blk: NonNull<BlockHdr>) {
        debug_assert!(self.validate_blkhdr(blk));
        debug_assert!(!blk.as_ref().is_free());

        let len = blk.as_ref().len;
        let (fl, sl) = Self::map_block(len);

        // The block is free from here on, so the list links may overlap
        // what used to be payload.
        let mut fblk = blk.cast::<FreeBlockHdr>();
        let head = self.first_free[fl][sl];
        if let Some(mut head) = head {
            head.as_mut().prev_free = Some(fblk);
        }
        fblk.as_mut().prev_free = None;
        fblk.as_mut().next_free = head;
        self.first_free[fl][sl] = Some(fblk);

        self.free += len;
        fblk.as_mut().common.len |= LEN_FREE;

        self.fl_bitmap |= 1usize << fl;
        self.sl_bitmap[fl] |= 1usize << sl;
    }

    /// Unlink a block from the `(fl, sl)` free list and clear its free
    /// mark. Removes `target` if given, otherwise pops the list head.
    /// Clears the second-level bit when the list drains, and the
    /// first-level bit when the whole second level drains.
    ///
    /// # Safety
    ///
    /// `target` (if given) must be on the `(fl, sl)` list; otherwise that
    /// list must be non-empty.
    unsafe fn remove_block(
        &mut self,
        target: Option<NonNull<FreeBlockHdr>>,
        fl: usize,
        sl: usize,
    ) -> NonNull<BlockHdr> {
        let mut blk = match target {
            Some(blk) => blk,
            None => self.first_free[fl][sl].unwrap_or_else(|| unreachable_unchecked()),
        };

        if let Some(mut next) = blk.as_ref().next_free {
            next.as_mut().prev_free = blk.as_ref().prev_free;
        }
        if let Some(mut prev) = blk.as_ref().prev_free {
            prev.as_mut().next_free = blk.as_ref().next_free;
        }
        if self.first_free[fl][sl] == Some(blk) {
            self.first_free[fl][sl] = blk.as_ref().next_free;
        }

        debug_assert!(blk.as_ref().common.is_free());
        blk.as_mut().common.len &= !LEN_FREE;
        self.free -= blk.as_ref().common.len;

        // Did the second-level list drain? Clear its bit, and the
        // first-level bit too once no second level under it has blocks.
        if self.first_free[fl][sl].is_none() {
            self.sl_bitmap[fl] &= !(1usize << sl);
            if self.sl_bitmap[fl] == 0 {
                self.fl_bitmap &= !(1usize << fl);
            }
        }

        let blk = blk.cast::<BlockHdr>();
        debug_assert!(self.validate_blkhdr(blk));
        blk
    }

    /// Shrink the free block `blk` to `size` and carve the remainder into
    /// a block of its own, which the caller is expected to insert. Returns
    /// `None` if header storage could not be obtained, in which case `blk`
    /// is restored to its full length.
    ///
    /// # Safety
    ///
    /// `blk` must be owned by `self`, off the free lists with its flag
    /// clear, and at least `size + blk_hdr_len + GRANULARITY` long.
    unsafe fn split_block(
        &mut self,
        blk: NonNull<BlockHdr>,
        size: usize,
    ) -> Option<NonNull<BlockHdr>> {
        let remsize = blk.as_ref().length() - self.blk_hdr_len - size;
        debug_assert!((remsize & LEN_FREE) == 0);
        debug_assert!((size & LEN_FREE) == 0);
        (*blk.as_ptr()).len = size;

        // The remainder inherits the tail of the parent block.
        match self.block_hdr_alloc(blk, remsize) {
            Some(remblk) => {
                debug_assert!(!blk.as_ref().is_free());
                debug_assert!(!remblk.as_ref().is_free());
                Some(remblk)
            }
            None => {
                // No header storage: undo, and let the caller hand out the
                // whole block.
                (*blk.as_ptr()).len = size + remsize;
                None
            }
        }
    }

    /// Merge two physically adjacent blocks, `blk` first. Either block may
    /// currently be free; the result is off the free lists with its flag
    /// clear. `blk2`'s header is destroyed.
    ///
    /// # Safety
    ///
    /// `blk2` must be `blk`'s immediate physical successor.
    unsafe fn merge_blocks(
        &mut self,
        blk: NonNull<BlockHdr>,
        blk2: NonNull<BlockHdr>,
    ) -> NonNull<BlockHdr> {
        let addlen = blk2.as_ref().length();

        debug_assert!(self.validate_blkhdr(blk));
        debug_assert!(self.validate_blkhdr(blk2));

        // Make sure neither side stays on a free list.
        if blk.as_ref().is_free() {
            let (fl, sl) = Self::map_block(blk.as_ref().length());
            self.remove_block(Some(blk.cast()), fl, sl);
        }
        if blk2.as_ref().is_free() {
            let (fl, sl) = Self::map_block(addlen);
            self.remove_block(Some(blk2.cast()), fl, sl);
        }

        // Grow the first block over the second, reclaiming the second's
        // header storage as payload in internal mode, then destroy the
        // second's header.
        (*blk.as_ptr()).len = blk.as_ref().len + self.blk_hdr_len + addlen;
        self.block_hdr_free(blk2);
        blk
    }

    /// The previous physical block of `blk`, or `None` at the start of the
    /// managed region.
    #[inline]
    unsafe fn prev_physblk(&self, blk: NonNull<BlockHdr>) -> Option<NonNull<BlockHdr>> {
        if self.blk_hdr_len != 0 {
            blk.as_ref().link.prev_phys
        } else {
            blk.cast::<ExtBlockHdr>().as_ref().chain_prev.map(NonNull::cast)
        }
    }

    /// The next physical block of `blk`, or `None` at the end of the
    /// managed region. Derived from the block length in internal mode,
    /// taken from the chain in external mode.
    #[inline]
    unsafe fn next_physblk(&self, blk: NonNull<BlockHdr>) -> Option<NonNull<BlockHdr>> {
        if self.blk_hdr_len != 0 {
            let space_end = self.base + self.size;
            let nblkptr = blk.as_ptr() as usize + BLKHDR_LEN + blk.as_ref().length();
            debug_assert!(nblkptr <= space_end);
            if nblkptr < space_end {
                Some(NonNull::new_unchecked(nblkptr as *mut BlockHdr))
            } else {
                None
            }
        } else {
            blk.cast::<ExtBlockHdr>().as_ref().chain_next.map(NonNull::cast)
        }
    }

    /// The managed address `blk` represents.
    #[inline]
    unsafe fn block_addr(&self, blk: NonNull<BlockHdr>) -> usize {
        if self.blk_hdr_len != 0 {
            blk.as_ptr() as usize
        } else {
            blk.as_ref().link.addr
        }
    }

    /// Acquire a header for the block of length `len` that immediately
    /// follows `parent`, wiring up the physical chain on both sides.
    /// `parent.len` must already hold its post-split length.
    ///
    /// Fails only in external mode, when the heap refuses a header.
    unsafe fn block_hdr_alloc(
        &mut self,
        parent: NonNull<BlockHdr>,
        len: usize,
    ) -> Option<NonNull<BlockHdr>> {
        if self.blk_hdr_len != 0 {
            let plen = parent.as_ref().length();
            let blk = NonNull::new_unchecked(
                (parent.as_ptr() as *mut u8).add(BLKHDR_LEN + plen) as *mut BlockHdr,
            );

            // The length must be written before the successor is derived
            // from this header.
            (*blk.as_ptr()).len = len;
            (*blk.as_ptr()).link.prev_phys = Some(parent);
            if let Some(mut nblk) = self.next_physblk(blk) {
                nblk.as_mut().link.prev_phys = Some(blk);
            }
            Some(blk)
        } else {
            let addr = parent.as_ref().link.addr + parent.as_ref().len;
            let ext = Self::ext_hdr_new(addr, len)?;
            self.chain_insert_after(parent.cast(), ext);
            Some(ext.cast())
        }
    }

    /// Destroy the header of `blk`, which must be mid-merge: allocated and
    /// about to be covered by its predecessor.
    unsafe fn block_hdr_free(&mut self, blk: NonNull<BlockHdr>) {
        debug_assert!(!blk.as_ref().is_free());

        if self.blk_hdr_len != 0 {
            // The header bytes become payload of the predecessor; only the
            // successor's back-pointer needs fixing up.
            if let Some(mut nextblk) = self.next_physblk(blk) {
                nextblk.as_mut().link.prev_phys = blk.as_ref().link.prev_phys;
                debug_assert!(self.validate_blkhdr(nextblk));
            }
        } else {
            let ext = blk.cast::<ExtBlockHdr>();
            self.chain_remove(ext);
            heap_dealloc(ext.as_ptr() as *mut u8, Layout::new::<ExtBlockHdr>());
        }
    }

    /// Allocate and initialize an external header for the managed range
    /// `addr..addr + len`, not yet on the chain.
    unsafe fn ext_hdr_new(addr: usize, len: usize) -> Option<NonNull<ExtBlockHdr>> {
        let ext = heap_alloc(Layout::new::<ExtBlockHdr>()) as *mut ExtBlockHdr;
        let ext = NonNull::new(ext)?;
        ext.as_ptr().write(ExtBlockHdr {
            hdr: FreeBlockHdr {
                common: BlockHdr {
                    len,
                    link: HdrLink { addr },
                },
                next_free: None,
                prev_free: None,
            },
            chain_next: None,
            chain_prev: None,
        });
        Some(ext)
    }

    unsafe fn chain_insert_head(&mut self, mut node: NonNull<ExtBlockHdr>) {
        node.as_mut().chain_prev = None;
        node.as_mut().chain_next = self.ext_chain;
        if let Some(mut head) = self.ext_chain {
            head.as_mut().chain_prev = Some(node);
        }
        self.ext_chain = Some(node);
    }

    unsafe fn chain_insert_after(
        &mut self,
        mut prev: NonNull<ExtBlockHdr>,
        mut node: NonNull<ExtBlockHdr>,
    ) {
        node.as_mut().chain_prev = Some(prev);
        node.as_mut().chain_next = prev.as_ref().chain_next;
        if let Some(mut next) = prev.as_ref().chain_next {
            next.as_mut().chain_prev = Some(node);
        }
        prev.as_mut().chain_next = Some(node);
    }

    unsafe fn chain_remove(&mut self, node: NonNull<ExtBlockHdr>) {
        let next = node.as_ref().chain_next;
        let prev = node.as_ref().chain_prev;
        if let Some(mut prev) = prev {
            prev.as_mut().chain_next = next;
        } else {
            self.ext_chain = next;
        }
        if let Some(mut next) = next {
            next.as_mut().chain_prev = prev;
        }
    }

    /// Diagnostic: check the consistency of a block header and of the
    /// pointers to its physical neighbours. Called under `debug_assert!`
    /// only.
    unsafe fn validate_blkhdr(&self, blk: NonNull<BlockHdr>) -> bool {
        let addr = self.block_addr(blk);
        let space_start = self.base;
        let space_end = self.base + self.size;
        let nextblk = self.next_physblk(blk);
        let prevblk = self.prev_physblk(blk);
        let blen = blk.as_ref().length();

        // The block must be at least one granule but no more than the
        // whole region, and must lie within the boundaries.
        assert!(blen >= GRANULARITY);
        assert!(blen <= self.size);
        assert!(addr >= space_start);
        assert!(addr < space_end);

        // The previous block's derived successor must be us, and the next
        // block must link back to us, unless this is the first or the last
        // physical block respectively.
        if addr == space_start {
            assert!(prevblk.is_none());
        } else {
            assert_eq!(self.next_physblk(prevblk.unwrap()), Some(blk));
        }
        if let Some(nextblk) = nextblk {
            assert_eq!(self.prev_physblk(nextblk), Some(blk));
        }
        true
    }
}

impl Drop for Tlsf {
    /// Release every external header still on the chain. The managed
    /// region itself is abandoned to the caller.
    fn drop(&mut self) {
        let mut node = self.ext_chain;
        while let Some(n) = node {
            // Safety: chain nodes are owned by `self` and each is visited
            //         exactly once.
            unsafe {
                node = n.as_ref().chain_next;
                heap_dealloc(n.as_ptr() as *mut u8, Layout::new::<ExtBlockHdr>());
            }
        }
    }
}

impl fmt::Debug for Tlsf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tlsf")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .field("free", &self.free)
            .field("exthdr", &(self.blk_hdr_len == 0))
            .field("fl_bitmap", &format_args!("{:#b}", self.fl_bitmap))
            .finish()
    }
}
