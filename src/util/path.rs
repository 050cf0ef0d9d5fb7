/* This file is part of proxyscan
 *
 * Copyright (C) 2020-2026 Dyne.org foundation
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{
    env,
    ffi::{CStr, OsString},
    mem,
    os::unix::ffi::OsStringExt,
    path::{Path, PathBuf},
    ptr,
};

use crate::{Error, Result};

/// Directory under the user's config dir holding our files
const CONFIG_SUBDIR: &str = "proxyscan";

/// Returns the path to the user's home directory.
/// Use `$HOME`, fallbacks to `libc::getpwuid_r`, otherwise `None`.
pub fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .or_else(|| unsafe { home_fallback() })
        .map(PathBuf::from)
}

/// Home directory from the passwd entry of the current user.
unsafe fn home_fallback() -> Option<OsString> {
    let amt = match libc::sysconf(libc::_SC_GETPW_R_SIZE_MAX) {
        n if n < 0 => 512_usize,
        n => n as usize,
    };

    let mut buf = Vec::with_capacity(amt);
    let mut passwd: libc::passwd = mem::zeroed();
    let mut result = ptr::null_mut();

    let r = libc::getpwuid_r(
        libc::getuid(),
        &mut passwd,
        buf.as_mut_ptr(),
        buf.capacity(),
        &mut result,
    );

    if r != 0 || result.is_null() {
        return None
    }

    let bytes = CStr::from_ptr(passwd.pw_dir).to_bytes();
    if bytes.is_empty() {
        return None
    }

    Some(OsString::from_vec(bytes.to_vec()))
}

/// Returns `$XDG_CONFIG_HOME`, `$HOME/.config`, or `None`.
pub fn config_dir() -> Option<PathBuf> {
    env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| home_dir().map(|h| h.join(".config")))
}

/// Expand a leading `~` to the home directory.
pub fn expand_path(path: &str) -> Result<PathBuf> {
    let Some(rest) = path.strip_prefix('~') else { return Ok(PathBuf::from(path)) };

    let Some(home) = home_dir() else {
        return Err(Error::ConfigInvalid(format!("cannot expand {}: no home directory", path)))
    };

    match rest.strip_prefix('/') {
        Some(remains) => Ok(home.join(remains)),
        None => Ok(home),
    }
}

/// Join a path with `config_dir()/proxyscan`.
pub fn join_config_path(file: &Path) -> Result<PathBuf> {
    let mut path = PathBuf::new();

    if let Some(v) = config_dir() {
        path.push(v);
    }

    path.push(CONFIG_SUBDIR);
    path.push(file);
    Ok(path)
}

/// Config file given on the command line, or the default one.
pub fn get_config_path(arg: Option<String>, fallback: &str) -> Result<PathBuf> {
    match arg {
        Some(a) => expand_path(&a),
        None => join_config_path(Path::new(fallback)),
    }
}
