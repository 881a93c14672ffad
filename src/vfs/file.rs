//! SQLite file I/O methods.
//!
//! Implements `sqlite3_io_methods` (version 2, including the shared-memory
//! methods WAL mode requires) on top of [`FileHandle`]. The `sqlite3_file`
//! object SQLite hands us carries a single raw pointer to the boxed handle;
//! closing the file drops the box, which releases locks and re-evaluates the
//! Content's destruction predicate.

use libsqlite3_sys as ffi;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use crate::content::FileKind;
use crate::error::VfsError;
use crate::handle::FileHandle;
use crate::lock::LockLevel;
use crate::registry::OpenOptions;
use crate::vfs::app_data;

/// An open file as seen by SQLite. The base struct must come first.
#[repr(C)]
pub struct MirageFile {
    pub base: ffi::sqlite3_file,
    handle: *mut FileHandle,
}

/// The shared method table; every open file points at this.
static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 2,
    xClose: Some(file_close),
    xRead: Some(file_read),
    xWrite: Some(file_write),
    xTruncate: Some(file_truncate),
    xSync: Some(file_sync),
    xFileSize: Some(file_file_size),
    xLock: Some(file_lock),
    xUnlock: Some(file_unlock),
    xCheckReservedLock: Some(file_check_reserved_lock),
    xFileControl: Some(file_file_control),
    xSectorSize: Some(file_sector_size),
    xDeviceCharacteristics: Some(file_device_characteristics),
    xShmMap: Some(file_shm_map),
    xShmLock: Some(file_shm_lock),
    xShmBarrier: Some(file_shm_barrier),
    xShmUnmap: Some(file_shm_unmap),
    xFetch: None,
    xUnfetch: None,
};

unsafe fn handle<'a>(file: *mut ffi::sqlite3_file) -> Option<&'a FileHandle> {
    let mirage = file as *mut MirageFile;
    if mirage.is_null() || (*mirage).handle.is_null() {
        return None;
    }
    Some(&*(*mirage).handle)
}

fn lock_level(level: c_int) -> LockLevel {
    match level {
        ffi::SQLITE_LOCK_SHARED => LockLevel::Shared,
        ffi::SQLITE_LOCK_RESERVED => LockLevel::Reserved,
        ffi::SQLITE_LOCK_PENDING => LockLevel::Pending,
        ffi::SQLITE_LOCK_EXCLUSIVE => LockLevel::Exclusive,
        _ => LockLevel::None,
    }
}

// VFS open callback; lives here with the rest of the file-object handling.

pub(crate) unsafe extern "C" fn file_open(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    let mirage = file as *mut MirageFile;
    if mirage.is_null() {
        return ffi::SQLITE_CANTOPEN;
    }
    // Until the open succeeds, the object must not look closeable to SQLite.
    (*mirage).base.pMethods = ptr::null();
    (*mirage).handle = ptr::null_mut();

    let Some(data) = app_data(vfs) else {
        return ffi::SQLITE_CANTOPEN;
    };

    let kind = if flags & ffi::SQLITE_OPEN_MAIN_DB != 0 {
        FileKind::MainDatabase
    } else if flags & ffi::SQLITE_OPEN_WAL != 0 {
        FileKind::WriteAheadLog
    } else {
        FileKind::Other
    };
    let opts = OpenOptions {
        create: flags & ffi::SQLITE_OPEN_CREATE != 0,
        exclusive: flags & ffi::SQLITE_OPEN_EXCLUSIVE != 0,
        delete_on_close: flags & ffi::SQLITE_OPEN_DELETEONCLOSE != 0,
        kind: Some(kind),
    };

    let opened = if z_name.is_null() {
        data.registry.open_anonymous()
    } else {
        match std::ffi::CStr::from_ptr(z_name).to_str() {
            Ok(path) => data.registry.open(path, opts),
            Err(_) => return ffi::SQLITE_CANTOPEN,
        }
    };

    match opened {
        Ok(h) => {
            (*mirage).handle = Box::into_raw(Box::new(h));
            (*mirage).base.pMethods = &IO_METHODS;
            if !p_out_flags.is_null() {
                *p_out_flags = flags;
            }
            ffi::SQLITE_OK
        }
        Err(VfsError::OutOfMemory(_)) => ffi::SQLITE_NOMEM,
        Err(_) => ffi::SQLITE_CANTOPEN,
    }
}

unsafe extern "C" fn file_close(file: *mut ffi::sqlite3_file) -> c_int {
    let mirage = file as *mut MirageFile;
    if !mirage.is_null() && !(*mirage).handle.is_null() {
        drop(Box::from_raw((*mirage).handle));
        (*mirage).handle = ptr::null_mut();
        (*mirage).base.pMethods = ptr::null();
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn file_read(
    file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let Some(handle) = handle(file) else {
        return ffi::SQLITE_IOERR_READ;
    };
    if offset < 0 || amt < 0 {
        return ffi::SQLITE_IOERR_READ;
    }
    let dst = std::slice::from_raw_parts_mut(buf as *mut u8, amt as usize);
    match handle.read_at(offset as u64, dst) {
        // The core zero-fills the tail of a short read.
        Ok(n) if n == amt as usize => ffi::SQLITE_OK,
        Ok(_) => ffi::SQLITE_IOERR_SHORT_READ,
        Err(_) => ffi::SQLITE_IOERR_READ,
    }
}

unsafe extern "C" fn file_write(
    file: *mut ffi::sqlite3_file,
    buf: *const c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let Some(handle) = handle(file) else {
        return ffi::SQLITE_IOERR_WRITE;
    };
    if offset < 0 || amt < 0 {
        return ffi::SQLITE_IOERR_WRITE;
    }
    let data = std::slice::from_raw_parts(buf as *const u8, amt as usize);
    match handle.write_at(offset as u64, data) {
        Ok(()) => ffi::SQLITE_OK,
        Err(VfsError::OutOfMemory(_)) => ffi::SQLITE_IOERR_NOMEM,
        Err(_) => ffi::SQLITE_IOERR_WRITE,
    }
}

unsafe extern "C" fn file_truncate(
    file: *mut ffi::sqlite3_file,
    size: ffi::sqlite3_int64,
) -> c_int {
    let Some(handle) = handle(file) else {
        return ffi::SQLITE_IOERR_TRUNCATE;
    };
    if size < 0 {
        return ffi::SQLITE_IOERR_TRUNCATE;
    }
    match handle.truncate(size as u64) {
        Ok(()) => ffi::SQLITE_OK,
        Err(_) => ffi::SQLITE_IOERR_TRUNCATE,
    }
}

unsafe extern "C" fn file_sync(file: *mut ffi::sqlite3_file, _flags: c_int) -> c_int {
    let Some(handle) = handle(file) else {
        return ffi::SQLITE_IOERR_FSYNC;
    };
    match handle.sync() {
        Ok(()) => ffi::SQLITE_OK,
        Err(_) => ffi::SQLITE_IOERR_FSYNC,
    }
}

unsafe extern "C" fn file_file_size(
    file: *mut ffi::sqlite3_file,
    p_size: *mut ffi::sqlite3_int64,
) -> c_int {
    let Some(handle) = handle(file) else {
        return ffi::SQLITE_IOERR_FSTAT;
    };
    match handle.size() {
        Ok(size) => {
            *p_size = size as ffi::sqlite3_int64;
            ffi::SQLITE_OK
        }
        Err(_) => ffi::SQLITE_IOERR_FSTAT,
    }
}

unsafe extern "C" fn file_lock(file: *mut ffi::sqlite3_file, level: c_int) -> c_int {
    let Some(handle) = handle(file) else {
        return ffi::SQLITE_IOERR_LOCK;
    };
    match handle.lock(lock_level(level)) {
        Ok(()) => ffi::SQLITE_OK,
        Err(VfsError::Busy(_)) => ffi::SQLITE_BUSY,
        Err(_) => ffi::SQLITE_IOERR_LOCK,
    }
}

unsafe extern "C" fn file_unlock(file: *mut ffi::sqlite3_file, level: c_int) -> c_int {
    let Some(handle) = handle(file) else {
        return ffi::SQLITE_IOERR_UNLOCK;
    };
    handle.unlock(lock_level(level));
    ffi::SQLITE_OK
}

unsafe extern "C" fn file_check_reserved_lock(
    file: *mut ffi::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    let Some(handle) = handle(file) else {
        return ffi::SQLITE_IOERR_CHECKRESERVEDLOCK;
    };
    match handle.check_reserved() {
        Ok(reserved) => {
            *p_res_out = reserved as c_int;
            ffi::SQLITE_OK
        }
        Err(_) => ffi::SQLITE_IOERR_CHECKRESERVEDLOCK,
    }
}

unsafe extern "C" fn file_file_control(
    _file: *mut ffi::sqlite3_file,
    _op: c_int,
    _p_arg: *mut c_void,
) -> c_int {
    // Unhandled opcodes must report NOTFOUND so SQLite applies its defaults.
    ffi::SQLITE_NOTFOUND
}

unsafe extern "C" fn file_sector_size(_file: *mut ffi::sqlite3_file) -> c_int {
    4096
}

unsafe extern "C" fn file_device_characteristics(_file: *mut ffi::sqlite3_file) -> c_int {
    // Memory writes are atomic, ordered under the registry mutex, and cannot
    // tear on power loss (there is nothing to lose).
    ffi::SQLITE_IOCAP_ATOMIC
        | ffi::SQLITE_IOCAP_SAFE_APPEND
        | ffi::SQLITE_IOCAP_SEQUENTIAL
        | ffi::SQLITE_IOCAP_POWERSAFE_OVERWRITE
}

unsafe extern "C" fn file_shm_map(
    file: *mut ffi::sqlite3_file,
    region: c_int,
    region_size: c_int,
    extend: c_int,
    pp: *mut *mut c_void,
) -> c_int {
    let Some(handle) = handle(file) else {
        return ffi::SQLITE_IOERR_SHMMAP;
    };
    if region < 0 || region_size <= 0 {
        return ffi::SQLITE_IOERR_SHMMAP;
    }
    match handle.shm_map(region as usize, region_size as usize, extend != 0) {
        Ok(Some(ptr)) => {
            *pp = ptr.as_ptr() as *mut c_void;
            ffi::SQLITE_OK
        }
        Ok(None) => {
            *pp = ptr::null_mut();
            ffi::SQLITE_OK
        }
        Err(VfsError::Busy(_)) => ffi::SQLITE_BUSY,
        Err(VfsError::OutOfMemory(_)) => ffi::SQLITE_IOERR_NOMEM,
        Err(_) => ffi::SQLITE_IOERR_SHMMAP,
    }
}

unsafe extern "C" fn file_shm_lock(
    file: *mut ffi::sqlite3_file,
    offset: c_int,
    count: c_int,
    flags: c_int,
) -> c_int {
    let Some(handle) = handle(file) else {
        return ffi::SQLITE_IOERR_SHMLOCK;
    };
    if offset < 0 || count < 0 {
        return ffi::SQLITE_IOERR_SHMLOCK;
    }
    let (offset, count) = (offset as usize, count as usize);
    let res = if flags & ffi::SQLITE_SHM_UNLOCK != 0 {
        handle.shm_unlock(offset, count)
    } else if flags & ffi::SQLITE_SHM_SHARED != 0 {
        handle.shm_lock_shared(offset, count)
    } else {
        handle.shm_lock_exclusive(offset, count)
    };
    match res {
        Ok(()) => ffi::SQLITE_OK,
        Err(VfsError::Busy(_)) => ffi::SQLITE_BUSY,
        Err(_) => ffi::SQLITE_IOERR_SHMLOCK,
    }
}

unsafe extern "C" fn file_shm_barrier(file: *mut ffi::sqlite3_file) {
    if let Some(handle) = handle(file) {
        handle.shm_barrier();
    }
}

unsafe extern "C" fn file_shm_unmap(file: *mut ffi::sqlite3_file, delete_flag: c_int) -> c_int {
    let Some(handle) = handle(file) else {
        return ffi::SQLITE_OK;
    };
    match handle.shm_unmap(delete_flag != 0) {
        Ok(()) => ffi::SQLITE_OK,
        Err(_) => ffi::SQLITE_IOERR_SHMMAP,
    }
}
