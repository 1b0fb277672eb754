//! String marshalling across the engine boundary.
//!
//! Engine builds differ in how they take string arguments: older builds use
//! nul-terminated 8-bit strings, newer ones nul-terminated UTF-16. The session
//! picks one [`StringEncoding`] at construction and uses it for every call and
//! every callback.

use std::ffi::{c_char, c_void, CStr, CString};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Character width of string arguments for a given engine build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    /// Nul-terminated 8-bit strings.
    #[default]
    Narrow,
    /// Nul-terminated UTF-16 strings.
    Wide,
}

/// An owned string laid out the way the engine expects it.
///
/// The pointer returned by [`NativeString::as_ptr`] is valid for as long as
/// the value lives.
#[derive(Debug, Clone)]
pub enum NativeString {
    Narrow(CString),
    Wide(Vec<u16>),
}

impl NativeString {
    /// Encode `value` for the engine, rejecting interior NUL characters.
    pub fn new(value: &str, encoding: StringEncoding) -> Result<Self> {
        if value.contains('\0') {
            return Err(SessionError::Configuration(format!(
                "string argument contains an interior NUL: {:?}",
                value
            )));
        }

        Ok(match encoding {
            StringEncoding::Narrow => NativeString::Narrow(
                CString::new(value).map_err(|e| SessionError::Configuration(e.to_string()))?,
            ),
            StringEncoding::Wide => {
                let mut units: Vec<u16> = value.encode_utf16().collect();
                units.push(0);
                NativeString::Wide(units)
            }
        })
    }

    pub fn as_ptr(&self) -> *const c_void {
        match self {
            NativeString::Narrow(s) => s.as_ptr().cast(),
            NativeString::Wide(units) => units.as_ptr().cast(),
        }
    }
}

/// Copy an engine-owned string into a Rust `String`.
///
/// A null pointer reads as the empty string. Invalid sequences are replaced
/// rather than rejected.
///
/// # Safety
///
/// `ptr` must be null or point to a nul-terminated string of the given
/// encoding that stays valid for the duration of the call.
pub unsafe fn read_native_string(ptr: *const c_void, encoding: StringEncoding) -> String {
    if ptr.is_null() {
        return String::new();
    }

    match encoding {
        StringEncoding::Narrow => CStr::from_ptr(ptr as *const c_char)
            .to_string_lossy()
            .into_owned(),
        StringEncoding::Wide => {
            let start = ptr as *const u16;
            let mut len = 0usize;
            while *start.add(len) != 0 {
                len += 1;
            }
            String::from_utf16_lossy(std::slice::from_raw_parts(start, len))
        }
    }
}
