use std::{io, ptr::NonNull, sync::OnceLock};

/// Abstraction for platform specific virtual memory handling. [`crate::Vm`]
/// needs to reserve address space, back parts of it with storage and take
/// that storage away again, but it doesn't care about the APIs offered by
/// the underlying kernel or libraries.
///
/// All the addresses passed to these functions are aligned to
/// [`VirtualMemory::page_size`] and all the lengths are multiples of it.
pub trait VirtualMemory {
    /// Virtual memory page size in bytes. Must be a power of two and must
    /// not change during the lifetime of the implementor.
    fn page_size(&self) -> usize;

    /// Reserves `length` bytes of address space without making any of them
    /// accessible. If `top_down` is set, the reservation should be placed
    /// as high in the address space as possible.
    ///
    /// # Safety
    ///
    /// `length` must be a non-zero multiple of the page size.
    unsafe fn reserve(&self, length: usize, top_down: bool) -> io::Result<NonNull<u8>>;

    /// Backs `length` bytes starting at `address` with storage and makes
    /// them readable and writable. The range might already be committed.
    ///
    /// # Safety
    ///
    /// The range must lie within a single reservation obtained from
    /// [`VirtualMemory::reserve`] on the same implementor.
    unsafe fn commit(&self, address: NonNull<u8>, length: usize) -> io::Result<()>;

    /// Takes the storage away from a range previously committed. The range
    /// stays reserved.
    ///
    /// # Safety
    ///
    /// Same as [`VirtualMemory::commit`]. Nothing may access the range
    /// afterwards until it's committed again.
    unsafe fn decommit(&self, address: NonNull<u8>, length: usize) -> io::Result<()>;

    /// Gives a whole reservation back to the OS.
    ///
    /// # Safety
    ///
    /// `address` and `length` must be exactly the ones used and returned
    /// by a previous call to [`VirtualMemory::reserve`].
    unsafe fn release(&self, address: NonNull<u8>, length: usize) -> io::Result<()>;
}

impl<M: VirtualMemory + ?Sized> VirtualMemory for &M {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    unsafe fn reserve(&self, length: usize, top_down: bool) -> io::Result<NonNull<u8>> {
        (**self).reserve(length, top_down)
    }

    unsafe fn commit(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
        (**self).commit(address, length)
    }

    unsafe fn decommit(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
        (**self).decommit(address, length)
    }

    unsafe fn release(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
        (**self).release(address, length)
    }
}

/// Zero sized type that implements [`VirtualMemory`] for each OS.
#[derive(Clone, Copy, Debug, Default)]
pub struct Platform;

/// The page size is only known at runtime, but it never changes while the
/// process is alive, so we ask once and reuse the answer.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Native page size of the OS in bytes. 4096 on most computers, 16384 on
/// Apple Silicon.
///
/// # Panics
///
/// If the OS can't tell us its page size or the answer isn't a power of
/// two. There's nothing sensible to do without it.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        let page_size = Platform::query_page_size();
        assert!(
            page_size.is_power_of_two(),
            "OS page size {page_size} is not a power of two"
        );
        page_size
    })
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::{
        io,
        ptr::{self, NonNull},
    };

    use super::{page_size, Platform, VirtualMemory};

    /// Reserved but uncommitted memory has no access at all.
    const RESERVE_PROTECTION: libc::c_int = libc::PROT_NONE;

    /// Memory should be private to our process and not mapped to any file.
    const FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    impl Platform {
        pub(super) fn query_page_size() -> usize {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
            if page_size <= 0 {
                panic!(
                    "sysconf(_SC_PAGE_SIZE) failed: {}",
                    io::Error::last_os_error()
                );
            }

            page_size as usize
        }
    }

    impl VirtualMemory for Platform {
        fn page_size(&self) -> usize {
            page_size()
        }

        unsafe fn reserve(&self, length: usize, _top_down: bool) -> io::Result<NonNull<u8>> {
            // There's no portable placement hint for mmap. Linux hands out
            // addresses from the top of the mmap area anyway.
            match libc::mmap(ptr::null_mut(), length, RESERVE_PROTECTION, FLAGS, -1, 0) {
                libc::MAP_FAILED => Err(io::Error::last_os_error()),
                address => NonNull::new(address.cast())
                    .ok_or_else(|| io::Error::other("mmap returned a null reservation")),
            }
        }

        unsafe fn commit(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
            // Private writable mappings are charged against the commit
            // limit, so this is where strict overcommit settings say no.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            if libc::mprotect(address.as_ptr().cast(), length, protection) != 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        }

        unsafe fn decommit(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
            // Mapping fresh inaccessible pages on top of the range drops the
            // old pages and their commit charge in one go while the range
            // stays ours.
            let flags = FLAGS | libc::MAP_FIXED;

            match libc::mmap(address.as_ptr().cast(), length, RESERVE_PROTECTION, flags, -1, 0) {
                libc::MAP_FAILED => Err(io::Error::last_os_error()),
                remapped if remapped.cast::<u8>() != address.as_ptr() => Err(io::Error::other(
                    "mmap with MAP_FIXED moved the decommitted range",
                )),
                _ => Ok(()),
            }
        }

        unsafe fn release(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
            if libc::munmap(address.as_ptr().cast(), length) != 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{io, mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{page_size, Platform, VirtualMemory};

    impl Platform {
        pub(super) fn query_page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();

            unsafe {
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());
                system_info.assume_init().dwPageSize as usize
            }
        }
    }

    impl VirtualMemory for Platform {
        fn page_size(&self) -> usize {
            page_size()
        }

        unsafe fn reserve(&self, length: usize, top_down: bool) -> io::Result<NonNull<u8>> {
            // Reserve only, committing happens page range by page range. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let mut flags = Memory::MEM_RESERVE;
            if top_down {
                flags = flags | Memory::MEM_TOP_DOWN;
            }

            let address = Memory::VirtualAlloc(None, length, flags, Memory::PAGE_NOACCESS);

            NonNull::new(address.cast()).ok_or_else(io::Error::last_os_error)
        }

        unsafe fn commit(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
            let committed = Memory::VirtualAlloc(
                Some(address.as_ptr().cast_const().cast()),
                length,
                Memory::MEM_COMMIT,
                Memory::PAGE_EXECUTE_READWRITE,
            );

            if committed.is_null() {
                return Err(io::Error::last_os_error());
            }

            // The address is page aligned, so Windows must not round it.
            assert_eq!(
                committed.cast::<u8>(),
                address.as_ptr(),
                "VirtualAlloc committed a different address than requested"
            );

            Ok(())
        }

        unsafe fn decommit(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
            let freed = Memory::VirtualFree(address.as_ptr().cast(), length, Memory::MEM_DECOMMIT);

            if !freed.as_bool() {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        }

        unsafe fn release(&self, address: NonNull<u8>, _length: usize) -> io::Result<()> {
            // MEM_RELEASE needs a length of 0 and releases the entire
            // reservation, committed or not.
            let freed = Memory::VirtualFree(address.as_ptr().cast(), 0, Memory::MEM_RELEASE);

            if !freed.as_bool() {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we'll use the global allocator to
    //! mock reservations. Everything reserved is readable and writable
    //! already, so committing and decommitting do nothing. Miri still
    //! catches reservations that are never released.

    use std::{alloc, io, ptr::NonNull};

    use super::{page_size, Platform, VirtualMemory};

    fn to_layout(length: usize) -> io::Result<alloc::Layout> {
        alloc::Layout::from_size_align(length, page_size())
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    impl Platform {
        pub(super) fn query_page_size() -> usize {
            4096
        }
    }

    impl VirtualMemory for Platform {
        fn page_size(&self) -> usize {
            page_size()
        }

        unsafe fn reserve(&self, length: usize, _top_down: bool) -> io::Result<NonNull<u8>> {
            NonNull::new(alloc::alloc(to_layout(length)?))
                .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
        }

        unsafe fn commit(&self, _address: NonNull<u8>, _length: usize) -> io::Result<()> {
            Ok(())
        }

        unsafe fn decommit(&self, _address: NonNull<u8>, _length: usize) -> io::Result<()> {
            Ok(())
        }

        unsafe fn release(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
            alloc::dealloc(address.as_ptr(), to_layout(length)?);
            Ok(())
        }
    }
}
