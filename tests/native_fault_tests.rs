//! Native fault tests: real guard faults and single-step traps.
//!
//! Ignored by default since they raise SIGSEGV/SIGTRAP in the test process.
//! Run with `cargo test --test native_fault_tests -- --ignored --test-threads=1`.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use core::ffi::c_void;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;

use pageguard::{Access, AccessMask, TrapFrame};

static WRITES: AtomicU64 = AtomicU64::new(0);
static LAST_ACCESS: AtomicUsize = AtomicUsize::new(0);

fn on_write(_frame: &mut dyn TrapFrame, access: Access) {
    WRITES.fetch_add(1, Ordering::SeqCst);
    LAST_ACCESS.store(access as usize, Ordering::SeqCst);
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Fresh read/write anonymous page.
fn map_page(size: usize) -> *mut c_void {
    let page = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(page, libc::MAP_FAILED);
    page
}

/// Handler currently installed for SIGSEGV.
fn segv_handler() -> libc::sighandler_t {
    let mut current: libc::sigaction = unsafe { core::mem::zeroed() };
    let ret = unsafe { libc::sigaction(libc::SIGSEGV, core::ptr::null(), &mut current) };
    assert_eq!(ret, 0);
    current.sa_sigaction
}

#[test]
#[ignore = "raises real faults"]
fn test_native_watch_fires_on_write() {
    let size = page_size();
    let page = map_page(size);
    let cell = page as *mut u64;

    pageguard::init().unwrap();
    pageguard::set_rearm_watches(true);
    pageguard::create_watch(cell as usize, AccessMask::WRITE, on_write).unwrap();

    unsafe { cell.write_volatile(1) };
    unsafe { cell.write_volatile(2) };

    assert_eq!(WRITES.load(Ordering::SeqCst), 2);
    assert_eq!(LAST_ACCESS.load(Ordering::SeqCst), Access::Write as usize);
    assert_eq!(unsafe { cell.read_volatile() }, 2);

    pageguard::shutdown();
    unsafe { libc::munmap(page, size) };
}

static CONCURRENT_READS: AtomicU64 = AtomicU64::new(0);

fn on_read(_frame: &mut dyn TrapFrame, _access: Access) {
    CONCURRENT_READS.fetch_add(1, Ordering::SeqCst);
}

#[test]
#[ignore = "raises real faults"]
fn test_native_concurrent_reads_on_watched_page() {
    const THREADS: usize = 8;
    const READS_PER_THREAD: usize = 20_000;

    let size = page_size();
    let page = map_page(size);
    let cell = page as *mut u64;
    unsafe { cell.write_volatile(42) };

    pageguard::init().unwrap();
    let ours = segv_handler();
    pageguard::set_rearm_watches(true);
    pageguard::create_watch(cell as usize, AccessMask::READ, on_read).unwrap();

    // Threads fault on the same page at once; one clears the guard while the
    // others are still entering their handlers.
    let address = cell as usize;
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            thread::spawn(move || {
                let cell = address as *const u64;
                for _ in 0..READS_PER_THREAD {
                    assert_eq!(unsafe { cell.read_volatile() }, 42);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(CONCURRENT_READS.load(Ordering::SeqCst) > 0);
    // No fault was handed to the default action.
    assert_eq!(segv_handler(), ours);

    pageguard::shutdown();
    unsafe { libc::munmap(page, size) };
}
