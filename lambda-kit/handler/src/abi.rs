//! C ABI for handlers built as shared libraries.
//!
//! Every exported handler symbol has the signature of [`RawHandlerFn`]: it takes the event and the
//! [`InvocationInfo`] as NUL-terminated JSON strings and returns a heap-allocated JSON
//! [`Envelope`]. The returned string must be released with the library's own
//! [`FREE_SYMBOL`] export, never with the caller's allocator.
//!
//! ```ignore
//! fn hello(event: Value, info: InvocationInfo) -> Result<Value, HandlerError> { ... }
//!
//! offline_handler::export_handlers! { hello => hello }
//! ```

use std::{
    ffi::{CStr, CString},
    os::raw::c_char,
    panic::AssertUnwindSafe,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{HandlerError, InvocationInfo};

/// Name of the deallocation export every handler library provides.
pub const FREE_SYMBOL: &str = "offline_handler_free";

pub type RawHandlerFn = unsafe extern "C" fn(event: *const c_char, info: *const c_char) -> *mut c_char;
pub type RawFreeFn = unsafe extern "C" fn(ptr: *mut c_char);

/// Outcome of one invocation as it crosses the library boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope {
    Ok(Value),
    Error(HandlerError),
}

impl From<Envelope> for Result<Value, HandlerError> {
    fn from(value: Envelope) -> Self {
        match value {
            Envelope::Ok(v) => Ok(v),
            Envelope::Error(e) => Err(e),
        }
    }
}

/// Run `handler` against raw JSON arguments and return an owned envelope string.
///
/// # Safety
/// `event` and `info` must be null or valid NUL-terminated strings.
pub unsafe fn invoke_raw<F>(handler: F, event: *const c_char, info: *const c_char) -> *mut c_char
where
    F: FnOnce(Value, InvocationInfo) -> Result<Value, HandlerError>,
{
    let args = unsafe { read_json::<Value>(event) }
        .and_then(|event| Ok((event, unsafe { read_json::<InvocationInfo>(info) }?)));

    let envelope = match args {
        Ok((event, info)) => match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event, info))) {
            Ok(Ok(v)) => Envelope::Ok(v),
            Ok(Err(err)) => Envelope::Error(err),
            Err(_) => Envelope::Error(HandlerError::new("handler panicked").with_type("Panic")),
        },
        Err(err) => Envelope::Error(err),
    };

    encode_envelope(&envelope).into_raw()
}

/// Release a string returned by [`invoke_raw`].
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by [`invoke_raw`] in this library.
pub unsafe fn free_raw(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}

/// Serialize an argument for a raw handler call.
pub fn encode_arg<T: Serialize>(value: &T) -> Result<CString, HandlerError> {
    let json = serde_json::to_string(value)?;
    CString::new(json).map_err(|err| HandlerError::new(err.to_string()).with_type("TypeError"))
}

/// Parse the envelope a raw handler returned. Does not free `ptr`.
///
/// # Safety
/// `ptr` must be null or a valid NUL-terminated string.
pub unsafe fn read_envelope(ptr: *const c_char) -> Result<Envelope, HandlerError> {
    unsafe { read_json(ptr) }
}

unsafe fn read_json<T: DeserializeOwned>(ptr: *const c_char) -> Result<T, HandlerError> {
    if ptr.is_null() {
        return Err(HandlerError::new("null pointer across handler ABI").with_type("TypeError"));
    }
    let text = unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|err| HandlerError::new(err.to_string()).with_type("TypeError"))?;
    Ok(serde_json::from_str(text)?)
}

fn encode_envelope(envelope: &Envelope) -> CString {
    let json = serde_json::to_string(envelope).unwrap_or_else(|err| {
        serde_json::json!({
            "error": { "errorMessage": err.to_string(), "errorType": "SerializationError" }
        })
        .to_string()
    });
    // serde_json escapes NUL, so this only falls back on a broken serializer.
    CString::new(json).unwrap_or_default()
}

/// Export handler functions with the [`RawHandlerFn`] signature, plus [`FREE_SYMBOL`].
///
/// Each handler is a `fn(Value, InvocationInfo) -> Result<Value, HandlerError>`. Use once per
/// library.
#[macro_export]
macro_rules! export_handlers {
    ($($name:ident => $func:path),* $(,)?) => {
        $(
            #[no_mangle]
            pub unsafe extern "C" fn $name(
                event: *const ::std::os::raw::c_char,
                info: *const ::std::os::raw::c_char,
            ) -> *mut ::std::os::raw::c_char {
                unsafe { $crate::abi::invoke_raw($func, event, info) }
            }
        )*

        #[no_mangle]
        pub unsafe extern "C" fn offline_handler_free(ptr: *mut ::std::os::raw::c_char) {
            unsafe { $crate::abi::free_raw(ptr) }
        }
    };
}
