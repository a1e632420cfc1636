// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-platform named inter-process counting semaphore.
// POSIX: `sem_open`/`sem_wait`/`sem_timedwait`/`sem_post`/`sem_unlink`.
// Windows: a named kernel semaphore object (`CreateSemaphoreW`).

use std::io;

/// A named, inter-process counting semaphore.
pub struct IpcSemaphore {
    #[cfg(unix)]
    inner: PosixSemaphore,
    #[cfg(windows)]
    inner: WindowsSemaphore,
}

impl IpcSemaphore {
    /// Open (or create) a named semaphore with the given initial count.
    pub fn open(name: &str, initial_count: u32) -> io::Result<Self> {
        #[cfg(unix)]
        let inner = PosixSemaphore::open(name, initial_count)?;
        #[cfg(windows)]
        let inner = WindowsSemaphore::open(name, initial_count)?;
        Ok(Self { inner })
    }

    /// Decrement the count, blocking until it is positive. `None` blocks
    /// indefinitely; `Some(ms)` returns `Ok(false)` on timeout.
    pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        self.inner.wait(timeout_ms)
    }

    /// Increment the count by `n`, waking up to `n` waiters.
    pub fn post(&self, n: u32) -> io::Result<()> {
        self.inner.post(n)
    }

    /// Remove the backing storage for a named semaphore.
    pub fn clear_storage(name: &str) {
        #[cfg(unix)]
        PosixSemaphore::clear_storage(name);
        #[cfg(windows)]
        {
            let _ = name;
        }
    }
}

#[cfg(unix)]
mod posix_impl {
    use super::*;
    use crate::shm_name::make_shm_name;
    use std::ffi::CString;

    pub struct PosixSemaphore {
        sem: *mut libc::sem_t,
    }

    unsafe impl Send for PosixSemaphore {}
    unsafe impl Sync for PosixSemaphore {}

    impl PosixSemaphore {
        pub fn open(name: &str, initial_count: u32) -> io::Result<Self> {
            let shm_name = make_shm_name(name);
            let cname = CString::new(shm_name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let sem = unsafe {
                libc::sem_open(
                    cname.as_ptr(),
                    libc::O_CREAT,
                    0o666,
                    initial_count as libc::c_uint,
                )
            };
            if sem == libc::SEM_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { sem })
        }

        pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
            match timeout_ms {
                None => {
                    let rc = unsafe { libc::sem_wait(self.sem) };
                    if rc != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(true)
                }
                Some(ms) => {
                    #[cfg(any(target_os = "linux", target_os = "android"))]
                    {
                        use std::time::{SystemTime, UNIX_EPOCH};
                        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
                        let deadline = now + std::time::Duration::from_millis(ms);
                        let ts = libc::timespec {
                            tv_sec: deadline.as_secs() as libc::time_t,
                            tv_nsec: deadline.subsec_nanos() as libc::c_long,
                        };
                        let rc = unsafe { libc::sem_timedwait(self.sem, &ts) };
                        if rc == 0 {
                            return Ok(true);
                        }
                        let err = io::Error::last_os_error();
                        if err.raw_os_error() == Some(libc::ETIMEDOUT) {
                            return Ok(false);
                        }
                        Err(err)
                    }
                    #[cfg(not(any(target_os = "linux", target_os = "android")))]
                    {
                        // `sem_timedwait` is not available on all unices (e.g. macOS);
                        // poll with `sem_trywait` instead.
                        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(ms);
                        loop {
                            let rc = unsafe { libc::sem_trywait(self.sem) };
                            if rc == 0 {
                                return Ok(true);
                            }
                            let err = io::Error::last_os_error();
                            if err.raw_os_error() != Some(libc::EAGAIN) {
                                return Err(err);
                            }
                            if std::time::Instant::now() >= deadline {
                                return Ok(false);
                            }
                            std::thread::sleep(std::time::Duration::from_millis(1));
                        }
                    }
                }
            }
        }

        pub fn post(&self, n: u32) -> io::Result<()> {
            for _ in 0..n {
                let rc = unsafe { libc::sem_post(self.sem) };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        pub fn clear_storage(name: &str) {
            let shm_name = make_shm_name(name);
            if let Ok(cname) = CString::new(shm_name) {
                unsafe {
                    libc::sem_unlink(cname.as_ptr());
                }
            }
        }
    }

    impl Drop for PosixSemaphore {
        fn drop(&mut self) {
            unsafe {
                libc::sem_close(self.sem);
            }
        }
    }
}

#[cfg(unix)]
use posix_impl::PosixSemaphore;

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::ptr;
    use windows_sys::Win32::Foundation::HANDLE;

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub struct WindowsSemaphore {
        handle: HANDLE,
    }

    unsafe impl Send for WindowsSemaphore {}
    unsafe impl Sync for WindowsSemaphore {}

    impl WindowsSemaphore {
        pub fn open(name: &str, initial_count: u32) -> io::Result<Self> {
            use windows_sys::Win32::System::Threading::CreateSemaphoreW;

            let wide_name = to_wide(name);
            let handle = unsafe {
                CreateSemaphoreW(ptr::null(), initial_count as i32, i32::MAX, wide_name.as_ptr())
            };
            if handle == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { handle })
        }

        pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
            use windows_sys::Win32::Foundation::{WAIT_OBJECT_0, WAIT_TIMEOUT};
            use windows_sys::Win32::System::Threading::{WaitForSingleObject, INFINITE};

            let millis = timeout_ms.map(|ms| ms as u32).unwrap_or(INFINITE);
            match unsafe { WaitForSingleObject(self.handle, millis) } {
                WAIT_OBJECT_0 => Ok(true),
                WAIT_TIMEOUT => Ok(false),
                _ => Err(io::Error::last_os_error()),
            }
        }

        pub fn post(&self, n: u32) -> io::Result<()> {
            use windows_sys::Win32::System::Threading::ReleaseSemaphore;

            if unsafe { ReleaseSemaphore(self.handle, n as i32, ptr::null_mut()) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    impl Drop for WindowsSemaphore {
        fn drop(&mut self) {
            use windows_sys::Win32::Foundation::CloseHandle;
            if self.handle != 0 {
                unsafe { CloseHandle(self.handle) };
            }
        }
    }
}

#[cfg(windows)]
use windows_impl::WindowsSemaphore;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name(prefix: &str) -> String {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{n}_{}", std::process::id())
    }

    #[test]
    fn wait_post_roundtrip() {
        let name = unique_name("sem_wp");
        IpcSemaphore::clear_storage(&name);
        let sem = IpcSemaphore::open(&name, 1).unwrap();
        assert!(sem.wait(Some(100)).unwrap());
        sem.post(1).unwrap();
        assert!(sem.wait(Some(100)).unwrap());
        IpcSemaphore::clear_storage(&name);
    }

    #[test]
    fn wait_times_out_when_empty() {
        let name = unique_name("sem_timeout");
        IpcSemaphore::clear_storage(&name);
        let sem = IpcSemaphore::open(&name, 0).unwrap();
        assert!(!sem.wait(Some(20)).unwrap());
        IpcSemaphore::clear_storage(&name);
    }
}
