//! C-ABI plumbing shared with `empath-ffi`.
//!
//! The dynamic module loader that used to live here (`dlopen`-based
//! `SharedLibrary`/`Module`) has been superseded by the in-process
//! interceptor chain in `empath-smtp`; only the string marshalling helpers
//! remain, since those are still needed wherever a C caller reads back a
//! `Context` field.

pub mod string;
