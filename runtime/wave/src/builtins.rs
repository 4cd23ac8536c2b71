//! # Host Builtins
//!
//! The fixed table of host functions a module may import from `env`. Each
//! builtin receives the raw 64-bit argument slots written by generated code
//! and the instance's committed linear memory.

use crate::{FunctionSignature, WasmType};

/// Host function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFunction {
    /// Close a descriptor: (fd: i32) -> i32. Always succeeds.
    CloseFd,
    /// Write linear memory to a descriptor: (fd: i32, ptr: i32, len: i32) -> i32
    WriteFd,
    /// Seek a descriptor: (fd: i32, offset: i64, whence: i32) -> i32. Always succeeds.
    LlseekFd,
}

impl HostFunction {
    /// Get the host function by import name.
    pub fn from_name(module: &str, name: &str) -> Option<Self> {
        if module != "env" {
            return None;
        }
        match name {
            "wasm_close_fd" => Some(Self::CloseFd),
            "wasm_write_fd" => Some(Self::WriteFd),
            "wasm_llseek_fd" => Some(Self::LlseekFd),
            _ => None,
        }
    }

    /// Import field name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CloseFd => "wasm_close_fd",
            Self::WriteFd => "wasm_write_fd",
            Self::LlseekFd => "wasm_llseek_fd",
        }
    }

    /// Get the function signature.
    pub fn signature(&self) -> FunctionSignature {
        match self {
            Self::CloseFd => FunctionSignature {
                params: vec![WasmType::I32],
                result: Some(WasmType::I32),
            },
            Self::WriteFd => FunctionSignature {
                params: vec![WasmType::I32, WasmType::I32, WasmType::I32],
                result: Some(WasmType::I32),
            },
            Self::LlseekFd => FunctionSignature {
                params: vec![WasmType::I32, WasmType::I64, WasmType::I32],
                result: Some(WasmType::I32),
            },
        }
    }

    /// Run the builtin. `args` holds exactly the declared parameters.
    pub fn call(&self, args: &[u64], memory: &[u8]) -> u64 {
        match self {
            Self::CloseFd | Self::LlseekFd => 0,
            Self::WriteFd => {
                let fd = args[0] as u32 as i32;
                let ptr = args[1] as u32 as usize;
                let len = args[2] as u32 as usize;
                let result = match ptr.checked_add(len).and_then(|end| memory.get(ptr..end)) {
                    Some(bytes) => {
                        // SAFETY: `bytes` is a live slice of committed linear memory.
                        let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
                        written as i32
                    }
                    None => {
                        log::warn!(
                            "wasm_write_fd: range {:#x}+{} outside {} bytes of memory",
                            ptr,
                            len,
                            memory.len()
                        );
                        -1
                    }
                };
                u64::from(result as u32)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_requires_env_module() {
        assert_eq!(
            HostFunction::from_name("env", "wasm_write_fd"),
            Some(HostFunction::WriteFd)
        );
        assert_eq!(HostFunction::from_name("wasi", "wasm_write_fd"), None);
        assert_eq!(HostFunction::from_name("env", "fd_write"), None);
    }

    #[test]
    fn test_names_round_trip() {
        for host in [HostFunction::CloseFd, HostFunction::WriteFd, HostFunction::LlseekFd] {
            assert_eq!(HostFunction::from_name("env", host.name()), Some(host));
        }
    }

    #[test]
    fn test_stub_builtins_return_zero() {
        assert_eq!(HostFunction::CloseFd.call(&[3], &[]), 0);
        assert_eq!(HostFunction::LlseekFd.call(&[3, 100, 0], &[]), 0);
    }

    #[test]
    fn test_write_fd_checks_range() {
        let memory = [0u8; 16];
        let result = HostFunction::WriteFd.call(&[1, 12, 8], &memory);
        assert_eq!(result, u64::from(u32::MAX));
    }

    #[test]
    fn test_write_fd_writes_to_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let memory = *b"..hello..";
        let written = HostFunction::WriteFd.call(&[fds[1] as u64, 2, 5], &memory);
        assert_eq!(written, 5);

        let mut buf = [0u8; 8];
        let read = unsafe { libc::read(fds[0], buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(read, 5);
        assert_eq!(&buf[..5], b"hello");

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
