use std::{fmt, ptr::NonNull};

use crate::{
    align::{self, is_aligned},
    error::{VmError, VmResult},
    params::VmParams,
    platform::{Platform, VirtualMemory},
};

/// Liveness tag of a [`Vm`]. It flips to [`Signature::Destroyed`] right
/// before the reservation is given back to the OS, so a handle whose
/// release blew up can't be mistaken for a usable one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signature {
    Live,
    Destroyed,
}

/// One reservation of address space plus the bookkeeping needed to commit
/// and decommit pieces of it. This is what an arena sits on top of:
///
/// ```text
///  block                                                     block + reserved
///    |                                                              |
///    v                                                              v
///    +--------+-------------+------------+-------------+------------+
///    | slack  |  committed  | reserved   |  committed  |   slack    |
///    +--------+-------------+------------+-------------+------------+
///             ^                                        ^
///             |                                        |
///            base (grain aligned)                    limit
/// ```
///
/// The OS only promises page alignment for `block`, so we reserve
/// `grain_size - page_size` extra bytes and slide `base` up to the next
/// grain boundary. Whatever is left on either side is never used. The
/// caller maps and unmaps page aligned ranges of `[base, limit)` and must
/// unmap everything before calling [`Vm::destroy`].
///
/// The handle does no locking. Every mutating operation takes `&mut self`,
/// so sharing one [`Vm`] between threads needs a lock around it, and
/// separate handles never interfere with each other.
pub struct Vm<P: VirtualMemory = Platform> {
    platform: P,
    /// Raw reservation, exactly as the OS handed it out.
    block: NonNull<u8>,
    /// First usable address.
    base: NonNull<u8>,
    /// One past the last usable address.
    limit: NonNull<u8>,
    /// Bytes reserved starting at `block`.
    reserved: usize,
    /// Bytes currently committed in `[base, limit)`.
    mapped: usize,
    grain_size: usize,
    page_size: usize,
    top_down: bool,
    signature: Signature,
}

// The pointers are owned by the handle and only dereferenced by the OS.
unsafe impl<P: VirtualMemory + Send> Send for Vm<P> {}
unsafe impl<P: VirtualMemory + Sync> Sync for Vm<P> {}

impl Vm {
    /// Reserves address space for a window of at least `size` bytes whose
    /// base is aligned to `grain_size`, using the native OS backend.
    ///
    /// ```rust
    /// use arenavm::{page_size, Vm, VmParams};
    ///
    /// let grain = 2 * page_size();
    /// let mut vm = Vm::create(10_000, grain, VmParams::default())?;
    /// assert_eq!(vm.size() % grain, 0);
    ///
    /// let base = vm.base();
    /// let end = unsafe { base.add(page_size()) };
    /// vm.map(base, end)?;
    /// unsafe { base.as_ptr().write(42) };
    /// assert_eq!(vm.mapped(), page_size());
    ///
    /// vm.unmap(base, end);
    /// vm.destroy();
    /// # Ok::<(), arenavm::VmError>(())
    /// ```
    pub fn create(size: usize, grain_size: usize, params: VmParams) -> VmResult<Self> {
        Self::create_in(Platform, size, grain_size, params)
    }
}

impl<P: VirtualMemory> Vm<P> {
    /// Same as [`Vm::create`] but reserves memory through `platform`.
    ///
    /// # Errors
    ///
    /// [`VmError::SizeOverflow`] if `size` rounded up to the grain size, or
    /// the total reservation, doesn't fit in the address space.
    /// [`VmError::Reserve`] if the OS has no room for the reservation.
    ///
    /// # Panics
    ///
    /// If `size` is zero or `grain_size` is not a power of two made of
    /// whole pages.
    pub fn create_in(
        platform: P,
        size: usize,
        grain_size: usize,
        params: VmParams,
    ) -> VmResult<Self> {
        assert!(size > 0, "cannot reserve an empty VM");

        let page_size = platform.page_size();
        assert!(
            align::grain_size_check(grain_size, page_size),
            "grain size {grain_size:#x} is not a power of two multiple of the page size {page_size:#x}"
        );

        let overflow = || VmError::SizeOverflow {
            size,
            grain: grain_size,
        };

        let size = align::align_up(size, grain_size)
            .filter(|rounded| *rounded >= grain_size)
            .ok_or_else(overflow)?;

        // Worst case the OS gives us a block that starts one page past a
        // grain boundary, so we need this much slack to slide up to the
        // next one. Pointer offsets can't exceed isize::MAX either.
        let reserved = size
            .checked_add(grain_size - page_size)
            .filter(|reserved| *reserved <= isize::MAX as usize)
            .ok_or_else(overflow)?;

        let block = unsafe { platform.reserve(reserved, params.top_down) }.map_err(|source| {
            VmError::Reserve {
                length: reserved,
                source,
            }
        })?;

        let block_address = block.as_ptr() as usize;

        // Only fails if the OS gave us the very last pages of the address
        // space, in which case `limit` isn't representable.
        let window = align::align_up(block_address, grain_size)
            .and_then(|base| Some((base, base.checked_add(size)?)))
            .filter(|(base, limit)| {
                is_aligned(block_address, page_size)
                    && base < limit
                    && block_address
                        .checked_add(reserved)
                        .is_some_and(|end| *limit <= end)
            });

        let Some((base_address, _)) = window else {
            // We are about to panic anyway, the OS error doesn't add much.
            let _ = unsafe { platform.release(block, reserved) };
            panic!("reservation of {reserved:#x} bytes at {block:p} has no room for an aligned window of {size:#x} bytes");
        };

        let (base, limit) = unsafe {
            let base = block.add(base_address - block_address);
            (base, base.add(size))
        };

        let vm = Self {
            platform,
            block,
            base,
            limit,
            reserved,
            mapped: 0,
            grain_size,
            page_size,
            top_down: params.top_down,
            signature: Signature::Live,
        };

        debug_assert!(vm.check());

        log::debug!(
            "created VM {block:p}: window [{base:p}, {limit:p}), {reserved:#x} bytes reserved"
        );

        Ok(vm)
    }

    /// Releases the reservation.
    ///
    /// # Panics
    ///
    /// If any bytes are still mapped, or if the OS refuses to release the
    /// reservation.
    pub fn destroy(mut self) {
        debug_assert!(self.check());
        assert_eq!(
            self.mapped, 0,
            "destroying VM {:p} with {:#x} bytes still mapped",
            self.block, self.mapped
        );

        self.release();
    }

    /// Commits `[base, limit)` so that it can be read and written. Fresh
    /// memory might not be zeroed. Mapping a range that is already mapped
    /// is not detected and counts twice towards [`Vm::mapped`].
    ///
    /// # Errors
    ///
    /// [`VmError::Commit`] if the OS can't back the range with storage. In
    /// that case nothing changes.
    ///
    /// # Panics
    ///
    /// If the range is empty, not page aligned or not inside
    /// `[self.base(), self.limit())`.
    pub fn map(&mut self, base: NonNull<u8>, limit: NonNull<u8>) -> VmResult<()> {
        debug_assert!(self.check());
        let length = self.range_length(base, limit);

        unsafe { self.platform.commit(base, length) }.map_err(|source| VmError::Commit {
            base: base.as_ptr() as usize,
            limit: limit.as_ptr() as usize,
            source,
        })?;

        self.mapped += length;
        assert!(
            self.mapped <= self.reserved,
            "VM {:p} has more bytes mapped than reserved",
            self.block
        );

        log::trace!("VM {:p}: mapped [{base:p}, {limit:p})", self.block);

        Ok(())
    }

    /// Decommits `[base, limit)`. The range stays reserved but must not be
    /// touched until it's mapped again.
    ///
    /// # Panics
    ///
    /// Same conditions as [`Vm::map`], if the range is larger than what's
    /// currently mapped, or if the OS refuses to decommit it.
    pub fn unmap(&mut self, base: NonNull<u8>, limit: NonNull<u8>) {
        debug_assert!(self.check());
        let length = self.range_length(base, limit);

        assert!(
            length <= self.mapped,
            "unmapping {length:#x} bytes from VM {:p} which only has {:#x} mapped",
            self.block,
            self.mapped
        );

        if let Err(err) = unsafe { self.platform.decommit(base, length) } {
            panic!("failed to decommit [{base:p}, {limit:p}): {err}");
        }

        self.mapped -= length;

        log::trace!("VM {:p}: unmapped [{base:p}, {limit:p})", self.block);
    }

    /// First usable address. Aligned to the grain size.
    pub fn base(&self) -> NonNull<u8> {
        debug_assert!(self.check());
        self.base
    }

    /// One past the last usable address.
    pub fn limit(&self) -> NonNull<u8> {
        debug_assert!(self.check());
        self.limit
    }

    /// Usable bytes, `limit - base`.
    pub fn size(&self) -> usize {
        self.limit.as_ptr() as usize - self.base.as_ptr() as usize
    }

    /// Bytes of address space reserved from the OS, slack included.
    pub fn reserved(&self) -> usize {
        debug_assert!(self.check());
        self.reserved
    }

    /// Bytes currently committed.
    pub fn mapped(&self) -> usize {
        debug_assert!(self.check());
        self.mapped
    }

    pub fn grain_size(&self) -> usize {
        self.grain_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_top_down(&self) -> bool {
        self.top_down
    }

    pub fn is_live(&self) -> bool {
        self.signature == Signature::Live
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Whether `address` falls inside `[base, limit)`.
    pub fn contains(&self, address: *const u8) -> bool {
        let address = address as usize;
        self.base.as_ptr() as usize <= address && address < self.limit.as_ptr() as usize
    }

    /// Checks every invariant of the handle. Returns `false` instead of
    /// panicking so callers can decide what a broken handle means to them.
    pub fn check(&self) -> bool {
        let block = self.block.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        let limit = self.limit.as_ptr() as usize;

        self.signature == Signature::Live
            && align::grain_size_check(self.grain_size, self.page_size)
            && block <= base
            && base < limit
            && block
                .checked_add(self.reserved)
                .is_some_and(|end| limit <= end)
            && self.mapped <= self.reserved
            && is_aligned(base, self.grain_size)
            && is_aligned(base, self.page_size)
            && is_aligned(limit, self.page_size)
    }

    /// Validates a range passed to [`Vm::map`] or [`Vm::unmap`] and
    /// returns its length in bytes.
    fn range_length(&self, base: NonNull<u8>, limit: NonNull<u8>) -> usize {
        assert!(self.is_live(), "VM {:p} used after destroy", self.block);

        let (start, end) = (base.as_ptr() as usize, limit.as_ptr() as usize);

        assert!(
            is_aligned(start, self.page_size) && is_aligned(end, self.page_size),
            "range [{base:p}, {limit:p}) is not aligned to the page size {:#x}",
            self.page_size
        );
        assert!(
            self.base <= base && base < limit && limit <= self.limit,
            "range [{base:p}, {limit:p}) is not inside VM window [{:p}, {:p})",
            self.base,
            self.limit
        );

        end - start
    }

    /// Marks the handle dead and gives the reservation back to the OS.
    fn release(&mut self) {
        log::debug!("destroying VM {:p}", self.block);

        self.signature = Signature::Destroyed;

        if let Err(err) = unsafe { self.platform.release(self.block, self.reserved) } {
            panic!(
                "failed to release {:#x} bytes reserved at {:p}: {err}",
                self.reserved, self.block
            );
        }
    }
}

impl<P: VirtualMemory> Drop for Vm<P> {
    fn drop(&mut self) {
        if !self.is_live() {
            return;
        }

        // Releasing the reservation also gets rid of any committed pages,
        // so nothing leaks, but the arena lost track of something.
        if self.mapped != 0 {
            log::warn!(
                "VM {:p} dropped with {:#x} bytes still mapped",
                self.block,
                self.mapped
            );
        }

        self.release();
    }
}

impl<P: VirtualMemory> fmt::Debug for Vm<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("block", &self.block)
            .field("base", &self.base)
            .field("limit", &self.limit)
            .field("reserved", &self.reserved)
            .field("mapped", &self.mapped)
            .field("grain_size", &self.grain_size)
            .field("top_down", &self.top_down)
            .field("signature", &self.signature)
            .finish()
    }
}
