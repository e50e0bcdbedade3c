//! Deterministic [`VirtualMemory`] implementation for tests. Reservations
//! come from the global allocator, the page size is whatever the test asks
//! for and every operation can be told to fail once, which lets us check
//! how [`crate::Vm`] reacts to the OS saying no without having to exhaust
//! the real address space.

use std::{
    alloc::{self, Layout},
    cell::{Cell, RefCell},
    collections::{BTreeSet, HashMap},
    io,
    ptr::NonNull,
};

use crate::platform::VirtualMemory;

/// Reservations are aligned to this many pages and then pushed one page
/// forward, so the block is page aligned but never aligned to any grain
/// between 2 and `SKEW_ALIGN_PAGES` pages. That forces [`crate::Vm`] to
/// actually use its alignment slack.
pub(crate) const SKEW_ALIGN_PAGES: usize = 16;

/// A raw allocation backing one reservation.
struct Reservation {
    raw: NonNull<u8>,
    layout: Layout,
    length: usize,
}

pub(crate) struct Simulated {
    page_size: usize,
    /// Reservations by the address we handed out.
    reservations: RefCell<HashMap<usize, Reservation>>,
    /// Addresses of committed pages.
    committed: RefCell<BTreeSet<usize>>,
    /// Arguments of the last successful reserve call.
    last_reserve: Cell<Option<(usize, bool)>>,
    fail_reserve: Cell<bool>,
    fail_commit: Cell<bool>,
    fail_decommit: Cell<bool>,
    fail_release: Cell<bool>,
}

impl Simulated {
    pub fn with_page_size(page_size: usize) -> Self {
        assert!(page_size.is_power_of_two());

        Self {
            page_size,
            reservations: RefCell::new(HashMap::new()),
            committed: RefCell::new(BTreeSet::new()),
            last_reserve: Cell::new(None),
            fail_reserve: Cell::new(false),
            fail_commit: Cell::new(false),
            fail_decommit: Cell::new(false),
            fail_release: Cell::new(false),
        }
    }

    pub fn fail_next_reserve(&self) {
        self.fail_reserve.set(true);
    }

    pub fn fail_next_commit(&self) {
        self.fail_commit.set(true);
    }

    pub fn fail_next_decommit(&self) {
        self.fail_decommit.set(true);
    }

    pub fn fail_next_release(&self) {
        self.fail_release.set(true);
    }

    /// Bytes currently committed, counting every page once.
    pub fn committed_bytes(&self) -> usize {
        self.committed.borrow().len() * self.page_size
    }

    /// Number of reservations that haven't been released yet.
    pub fn live_reservations(&self) -> usize {
        self.reservations.borrow().len()
    }

    /// `(length, top_down)` of the last successful reservation.
    pub fn last_reserve(&self) -> Option<(usize, bool)> {
        self.last_reserve.get()
    }

    /// Makes sure `[address, address + length)` is inside one reservation,
    /// which is what the OS would reject with `EINVAL` otherwise.
    fn check_range(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
        let start = address.as_ptr() as usize;
        let end = start + length;

        let inside = self.reservations.borrow().iter().any(|(base, reservation)| {
            *base <= start && end <= *base + reservation.length
        });

        if !inside || length % self.page_size != 0 || start % self.page_size != 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        Ok(())
    }

    fn pages(&self, address: NonNull<u8>, length: usize) -> impl Iterator<Item = usize> {
        let start = address.as_ptr() as usize;
        (start..start + length).step_by(self.page_size)
    }
}

impl VirtualMemory for Simulated {
    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn reserve(&self, length: usize, top_down: bool) -> io::Result<NonNull<u8>> {
        if self.fail_reserve.replace(false) {
            return Err(io::Error::from(io::ErrorKind::OutOfMemory));
        }

        let layout = length
            .checked_add(self.page_size)
            .and_then(|size| {
                Layout::from_size_align(size, self.page_size * SKEW_ALIGN_PAGES).ok()
            })
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

        let raw = NonNull::new(alloc::alloc(layout))
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let address = raw.add(self.page_size);

        self.reservations.borrow_mut().insert(
            address.as_ptr() as usize,
            Reservation {
                raw,
                layout,
                length,
            },
        );
        self.last_reserve.set(Some((length, top_down)));

        Ok(address)
    }

    unsafe fn commit(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
        self.check_range(address, length)?;

        if self.fail_commit.replace(false) {
            return Err(io::Error::from(io::ErrorKind::OutOfMemory));
        }

        self.committed
            .borrow_mut()
            .extend(self.pages(address, length));

        Ok(())
    }

    unsafe fn decommit(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
        self.check_range(address, length)?;

        if self.fail_decommit.replace(false) {
            return Err(io::Error::other("injected decommit failure"));
        }

        let mut committed = self.committed.borrow_mut();
        for page in self.pages(address, length) {
            committed.remove(&page);
        }

        Ok(())
    }

    unsafe fn release(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
        if self.fail_release.replace(false) {
            return Err(io::Error::other("injected release failure"));
        }

        let start = address.as_ptr() as usize;
        let mut reservations = self.reservations.borrow_mut();

        let reservation = match reservations.remove(&start) {
            Some(reservation) if reservation.length == length => reservation,
            Some(reservation) => {
                reservations.insert(start, reservation);
                return Err(io::Error::from(io::ErrorKind::InvalidInput));
            }
            None => return Err(io::Error::from(io::ErrorKind::InvalidInput)),
        };

        self.committed
            .borrow_mut()
            .retain(|page| *page < start || *page >= start + length);

        alloc::dealloc(reservation.raw.as_ptr(), reservation.layout);

        Ok(())
    }
}

impl Drop for Simulated {
    fn drop(&mut self) {
        // Tests that panic on purpose can leave reservations behind.
        for (_, reservation) in self.reservations.get_mut().drain() {
            unsafe { alloc::dealloc(reservation.raw.as_ptr(), reservation.layout) };
        }
    }
}
