//! Host process argument and environment accessors.
//!
//! Module initializers are invoked with the host's `(argc, argv, envp)`, the
//! same vectors `main` received. The C vectors are rebuilt from the process
//! environment and kept alive for the duration of the calls.

use std::ffi::CString;
use std::os::raw::{c_char, c_int};

/// Owned argv/envp vectors in C calling-convention shape.
pub struct ProgramArgs {
    // Backing storage for the pointer vectors below.
    _args: Vec<CString>,
    _envs: Vec<CString>,
    argv: Vec<*const c_char>,
    envp: Vec<*const c_char>,
}

impl ProgramArgs {
    /// Captures the current process arguments and environment.
    pub fn capture() -> ProgramArgs {
        let args: Vec<CString> = std::env::args()
            .filter_map(|a| CString::new(a).ok())
            .collect();
        let envs: Vec<CString> = std::env::vars()
            .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
            .collect();

        let mut argv: Vec<*const c_char> = args.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());
        let mut envp: Vec<*const c_char> = envs.iter().map(|e| e.as_ptr()).collect();
        envp.push(std::ptr::null());

        ProgramArgs {
            _args: args,
            _envs: envs,
            argv,
            envp,
        }
    }

    pub fn argc(&self) -> c_int {
        (self.argv.len() - 1) as c_int
    }

    pub fn argv(&self) -> *const *const c_char {
        self.argv.as_ptr()
    }

    pub fn envp(&self) -> *const *const c_char {
        self.envp.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captured_vectors_are_null_terminated() {
        let args = ProgramArgs::capture();
        assert!(args.argc() >= 1);
        let argv = args.argv();
        unsafe {
            assert!(!(*argv).is_null());
            assert!((*argv.add(args.argc() as usize)).is_null());
        }
    }
}
