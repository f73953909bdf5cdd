// src/filemap.rs
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use libc::{c_int, c_void};

use crate::syscalls;

/// Snapshot lifecycle. The tag records the last stage attempted; an error
/// leaves the map in a consistent "failed at stage X" state that consumers
/// translate into a status code (Open -> 404, Fstat..Read -> 403).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    Open,
    Fadvise,
    Fstat,
    Memalign,
    Madvise,
    Read,
    Finish,
}

#[derive(Debug)]
pub struct MapError {
    pub errno: i32,
    pub message: String,
}

/// An in-memory snapshot of a file, used as a response body.
///
/// Construction runs open -> fadvise(sequential) -> fstat -> aligned alloc
/// of `st_size` -> madvise(sequential) -> read, closing the fd before
/// returning regardless of outcome. `data` is non-null iff the final stage
/// is `Finish`.
pub struct FileMap {
    data: *mut u8,
    size: usize,
    stage: Stage,
    error: Option<MapError>,
}

// The allocation is reachable only through this value.
unsafe impl Send for FileMap {}

struct Fd(c_int);

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

impl Default for FileMap {
    fn default() -> Self {
        Self { data: ptr::null_mut(), size: 0, stage: Stage::Init, error: None }
    }
}

impl FileMap {
    pub fn open(path: &Path) -> Self {
        let mut map = Self::default();

        let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
            map.stage = Stage::Open;
            map.fail(libc::EINVAL);
            return map;
        };

        unsafe {
            map.stage = Stage::Open;
            let fd = libc::open(cpath.as_ptr(), libc::O_RDONLY);
            if fd < 0 {
                map.fail(syscalls::errno());
                return map;
            }
            let fd = Fd(fd);

            map.stage = Stage::Fadvise;
            let r = libc::posix_fadvise(fd.0, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
            if r != 0 {
                map.fail(r);
                return map;
            }

            map.stage = Stage::Fstat;
            let mut st: libc::stat = mem::zeroed();
            if libc::fstat(fd.0, &mut st) < 0 {
                map.fail(syscalls::errno());
                return map;
            }

            let fsize = st.st_size as usize;
            let blksize = st.st_blksize as usize;
            if !blksize.is_power_of_two() {
                map.error = Some(MapError {
                    errno: libc::EINVAL,
                    message: format!("invalid block size {blksize}"),
                });
                return map;
            }

            map.stage = Stage::Memalign;
            let mut p: *mut c_void = ptr::null_mut();
            let align = blksize.max(mem::size_of::<usize>());
            let r = libc::posix_memalign(&mut p, align, fsize.max(1));
            if r != 0 {
                map.fail(r);
                return map;
            }
            map.data = p as *mut u8;
            map.size = fsize;

            map.stage = Stage::Madvise;
            let r = libc::posix_madvise(p, fsize, libc::POSIX_MADV_SEQUENTIAL);
            if r != 0 {
                map.fail(r);
                return map;
            }

            map.stage = Stage::Read;
            let mut off = 0usize;
            while off < fsize {
                let n = libc::read(fd.0, map.data.add(off) as *mut c_void, fsize - off);
                if n < 0 {
                    map.fail(syscalls::errno());
                    return map;
                }
                if n == 0 {
                    break;
                }
                off += n as usize;
            }

            map.stage = Stage::Finish;
        }

        map
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn error(&self) -> Option<&MapError> {
        self.error.as_ref()
    }

    pub fn size(&self) -> usize {
        if self.error.is_none() {
            self.size
        } else {
            0
        }
    }

    pub fn view(&self) -> &[u8] {
        if self.data.is_null() || self.error.is_some() || self.size == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data, self.size) }
    }

    fn fail(&mut self, errno: i32) {
        self.error = Some(MapError {
            errno,
            message: io::Error::from_raw_os_error(errno).to_string(),
        });
        // Keep the non-null-iff-finished invariant on late failures.
        if !self.data.is_null() {
            unsafe { libc::free(self.data as *mut c_void) };
            self.data = ptr::null_mut();
            self.size = 0;
        }
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe { libc::free(self.data as *mut c_void) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_file_fails_at_open() {
        let map = FileMap::open(Path::new("/definitely/not/here.html"));
        assert_eq!(map.stage(), Stage::Open);
        let err = map.error().expect("error recorded");
        assert_eq!(err.errno, libc::ENOENT);
        assert!(map.view().is_empty());
    }

    #[test]
    fn directory_fails_after_open() {
        let dir = tempfile::tempdir().unwrap();
        let map = FileMap::open(dir.path());
        assert!(map.error().is_some());
        assert!(map.stage() > Stage::Open);
        assert!(map.stage() <= Stage::Read);
        assert!(map.view().is_empty());
    }

    #[test]
    fn regular_file_snapshots_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        fs::write(&path, b"<h1>hi</h1>").unwrap();

        let map = FileMap::open(&path);
        assert!(map.error().is_none(), "{:?}", map.error());
        assert_eq!(map.stage(), Stage::Finish);
        assert_eq!(map.view(), b"<h1>hi</h1>");
        assert_eq!(map.size(), 11);
    }

    #[test]
    fn empty_file_finishes_with_empty_view() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        fs::write(&path, b"").unwrap();

        let map = FileMap::open(&path);
        assert!(map.error().is_none());
        assert_eq!(map.stage(), Stage::Finish);
        assert_eq!(map.size(), 0);
        assert!(map.view().is_empty());
    }
}
