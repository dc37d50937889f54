//! Helpers for profiling scopes.
//!
//! These compile down to [`puffin`] scopes on native targets and to nothing on `wasm32`.

pub mod reexports {
    #[cfg(not(target_arch = "wasm32"))]
    pub use puffin;
}

/// Profiles the enclosing function.
#[macro_export]
macro_rules! profile_function {
    ($($arg: tt)*) => {
        #[cfg(not(target_arch = "wasm32"))]
        $crate::reexports::puffin::profile_function!($($arg)*);
    };
}

/// Profiles the rest of the enclosing block under the given name.
#[macro_export]
macro_rules! profile_scope {
    ($($arg: tt)*) => {
        #[cfg(not(target_arch = "wasm32"))]
        $crate::reexports::puffin::profile_scope!($($arg)*);
    };
}

/// Profiles time spent blocked on something else, e.g. a channel or a join.
///
/// Shows up as a scope prefixed with `wait:` so it is easy to tell apart from actual work.
#[macro_export]
macro_rules! profile_wait {
    () => {
        #[cfg(not(target_arch = "wasm32"))]
        $crate::reexports::puffin::profile_scope!("wait");
    };
    ($id:expr) => {
        #[cfg(not(target_arch = "wasm32"))]
        $crate::reexports::puffin::profile_scope!(concat!("wait: ", $id));
    };
    ($id:expr, $data:expr) => {
        #[cfg(not(target_arch = "wasm32"))]
        $crate::reexports::puffin::profile_scope!(concat!("wait: ", $id), $data);
    };
}
