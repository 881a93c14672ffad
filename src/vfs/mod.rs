//! SQLite VFS registration.
//!
//! Implements the `sqlite3_vfs` interface so the embedded engine can use a
//! [`Registry`](crate::registry::Registry) as its storage backend. Each
//! registration binds one registry to one VFS name; multiple independent
//! registrations can coexist in a process, and connections select one with
//! `file:db?vfs=NAME` or the equivalent open flag.

mod file;

pub use file::MirageFile;

use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use tracing::debug;

use crate::error::{Result, VfsError};
use crate::registry::Registry;

/// Default VFS name.
pub const VFS_NAME: &str = "mirage";

/// Data hung off `sqlite3_vfs.pAppData` for one registration.
pub(crate) struct VfsAppData {
    pub(crate) registry: Registry,
    name: CString,
}

pub(crate) unsafe fn app_data<'a>(vfs: *mut ffi::sqlite3_vfs) -> Option<&'a VfsAppData> {
    if vfs.is_null() {
        return None;
    }
    let data = (*vfs).pAppData as *const VfsAppData;
    if data.is_null() {
        return None;
    }
    Some(&*data)
}

/// Allocations behind a live registration, kept so unregistering frees
/// exactly what we created and never touches a foreign VFS.
struct Registration {
    name: String,
    vfs: usize,
    data: usize,
}

static REGISTRATIONS: Mutex<Vec<Registration>> = Mutex::new(Vec::new());

/// Register `registry` with SQLite under `name`.
///
/// Fails `Busy` if this process already registered that name through this
/// crate. The registration is never made the process default; connections
/// opt in by name.
pub fn register_vfs(name: &str, registry: Registry) -> Result<()> {
    let c_name = CString::new(name)
        .map_err(|_| VfsError::InvalidArgument("VFS name contains a NUL byte".into()))?;

    let mut registrations = REGISTRATIONS.lock();
    if registrations.iter().any(|r| r.name == name) {
        return Err(VfsError::Busy(format!("VFS {} is already registered", name)));
    }

    let data = Box::into_raw(Box::new(VfsAppData {
        registry,
        name: c_name,
    }));

    let vfs = Box::into_raw(Box::new(ffi::sqlite3_vfs {
        iVersion: 3,
        szOsFile: std::mem::size_of::<MirageFile>() as c_int,
        mxPathname: 1024,
        pNext: std::ptr::null_mut(),
        zName: unsafe { (*data).name.as_ptr() },
        pAppData: data as *mut c_void,
        xOpen: Some(vfs_open),
        xDelete: Some(vfs_delete),
        xAccess: Some(vfs_access),
        xFullPathname: Some(vfs_full_pathname),
        xDlOpen: None,
        xDlError: None,
        xDlSym: None,
        xDlClose: None,
        xRandomness: Some(vfs_randomness),
        xSleep: Some(vfs_sleep),
        xCurrentTime: Some(vfs_current_time),
        xGetLastError: Some(vfs_get_last_error),
        xCurrentTimeInt64: Some(vfs_current_time_int64),
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    }));

    let rc = unsafe { ffi::sqlite3_vfs_register(vfs, 0) };
    if rc != ffi::SQLITE_OK {
        unsafe {
            drop(Box::from_raw(vfs));
            drop(Box::from_raw(data));
        }
        return Err(VfsError::InvalidArgument(format!(
            "VFS registration failed with code {}",
            rc
        )));
    }

    registrations.push(Registration {
        name: name.to_string(),
        vfs: vfs as usize,
        data: data as usize,
    });
    debug!("registered VFS {}", name);
    Ok(())
}

/// Unregister a VFS previously registered through this crate and release its
/// registry reference. Unregistering a name this crate never registered is a
/// no-op.
pub fn unregister_vfs(name: &str) -> Result<()> {
    let mut registrations = REGISTRATIONS.lock();
    let Some(at) = registrations.iter().position(|r| r.name == name) else {
        return Ok(());
    };
    let vfs = registrations[at].vfs as *mut ffi::sqlite3_vfs;

    let rc = unsafe { ffi::sqlite3_vfs_unregister(vfs) };
    if rc != ffi::SQLITE_OK {
        return Err(VfsError::Busy(format!(
            "VFS unregistration failed with code {}",
            rc
        )));
    }

    let reg = registrations.remove(at);
    unsafe {
        drop(Box::from_raw(reg.data as *mut VfsAppData));
        drop(Box::from_raw(reg.vfs as *mut ffi::sqlite3_vfs));
    }
    debug!("unregistered VFS {}", name);
    Ok(())
}

// VFS callback functions.

unsafe extern "C" fn vfs_open(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    file::file_open(vfs, z_name, file, flags, p_out_flags)
}

unsafe extern "C" fn vfs_delete(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    _sync_dir: c_int,
) -> c_int {
    let Some(data) = app_data(vfs) else {
        return ffi::SQLITE_ERROR;
    };
    let path = match CStr::from_ptr(z_name).to_str() {
        Ok(p) => p,
        Err(_) => return ffi::SQLITE_ERROR,
    };
    match data.registry.delete(path) {
        Ok(()) => ffi::SQLITE_OK,
        Err(VfsError::NotFound(_)) => ffi::SQLITE_IOERR_DELETE_NOENT,
        Err(_) => ffi::SQLITE_IOERR_DELETE,
    }
}

unsafe extern "C" fn vfs_access(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    _flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    let Some(data) = app_data(vfs) else {
        return ffi::SQLITE_ERROR;
    };
    let path = match CStr::from_ptr(z_name).to_str() {
        Ok(p) => p,
        Err(_) => return ffi::SQLITE_ERROR,
    };
    *p_res_out = data.registry.exists(path) as c_int;
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_full_pathname(
    _vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    // Names are already canonical inside the volatile namespace.
    let len = libc::strlen(z_name);
    if len >= n_out as usize {
        return ffi::SQLITE_CANTOPEN;
    }
    libc::strcpy(z_out, z_name);
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_randomness(
    _vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_out: *mut c_char,
) -> c_int {
    use rand::RngCore;

    if n_byte <= 0 {
        return 0;
    }
    let out = std::slice::from_raw_parts_mut(z_out as *mut u8, n_byte as usize);
    rand::thread_rng().fill_bytes(out);
    n_byte
}

unsafe extern "C" fn vfs_sleep(_vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    std::thread::sleep(std::time::Duration::from_micros(microseconds.max(0) as u64));
    microseconds
}

unsafe extern "C" fn vfs_current_time(_vfs: *mut ffi::sqlite3_vfs, p_time_out: *mut f64) -> c_int {
    use std::time::{SystemTime, UNIX_EPOCH};

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    // Julian day number (days since noon UTC on November 24, 4714 BC).
    *p_time_out = 2440587.5 + (duration.as_secs_f64() / 86400.0);
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_current_time_int64(
    _vfs: *mut ffi::sqlite3_vfs,
    p_time_out: *mut ffi::sqlite3_int64,
) -> c_int {
    use std::time::{SystemTime, UNIX_EPOCH};

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    // Julian day in milliseconds.
    *p_time_out = 210866760000000i64 + (duration.as_millis() as i64);
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_get_last_error(
    vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_err_msg: *mut c_char,
) -> c_int {
    // Best-effort diagnostic mirror of the registry's last error.
    if let Some(data) = app_data(vfs) {
        if let Some(err) = data.registry.last_error() {
            if n_byte > 0 && !z_err_msg.is_null() {
                let msg = err.to_string();
                let bytes = msg.as_bytes();
                let n = bytes.len().min(n_byte as usize - 1);
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), z_err_msg as *mut u8, n);
                *z_err_msg.add(n) = 0;
            }
        }
    }
    0
}
