//! # Instances
//!
//! A loaded module together with its runtime. The runtime sits behind a
//! `spin::Mutex` so one instance never runs two calls on the same scratch
//! regions.

use std::sync::Arc;

use spin::Mutex;

use crate::bridge::Runtime;
use crate::jit::JitStats;
use crate::module::{ExternalKind, Module};
use crate::{WasmValue, WaveConfig, WaveError};

/// An instantiated module.
pub struct Instance {
    module: Arc<Module>,
    runtime: Mutex<Runtime>,
}

impl Instance {
    /// Parse and link `bytes`, then run the start function if there is one.
    pub fn new(bytes: &[u8], config: WaveConfig) -> Result<Self, WaveError> {
        let module = Module::parse(bytes)?;
        Self::from_module(Arc::new(module), config)
    }

    /// Instantiate an already parsed module.
    pub fn from_module(module: Arc<Module>, config: WaveConfig) -> Result<Self, WaveError> {
        let mut runtime = Runtime::new(module.clone(), &config)?;
        if let Some(start) = module.start {
            log::debug!("running start function {}", start);
            runtime.call(start, &[])?;
        }
        Ok(Self {
            module,
            runtime: Mutex::new(runtime),
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Call the exported function `name`.
    pub fn invoke(&self, name: &str, args: &[WasmValue]) -> Result<Option<WasmValue>, WaveError> {
        let export = self
            .module
            .export(name)
            .ok_or_else(|| WaveError::Link(format!("no export named {:?}", name)))?;
        if export.kind != ExternalKind::Function {
            return Err(WaveError::Link(format!(
                "export {:?} is a {:?}, not a function",
                name, export.kind
            )));
        }
        let index = export.index;
        let signature = self
            .module
            .signature(index)
            .ok_or_else(|| WaveError::Link(format!("export {:?} has no function {}", name, index)))?;

        let actual: Vec<_> = args.iter().map(WasmValue::value_type).collect();
        if actual != signature.params {
            return Err(WaveError::Link(format!(
                "{} expects {} but got {:?}",
                name, signature, actual
            )));
        }

        let mut runtime = self
            .runtime
            .try_lock()
            .ok_or_else(|| WaveError::Resource("instance is already running a call".into()))?;
        log::debug!("invoking {} (function {})", name, index);
        runtime.call(index, args)
    }

    /// Current value of global `index`.
    pub fn global(&self, index: u32) -> Option<WasmValue> {
        let ty = self.module.globals.get(index as usize)?.ty;
        let bits = self.runtime.lock().global_bits(index)?;
        Some(WasmValue::from_bits(ty, bits))
    }

    /// Current linear-memory size in pages.
    pub fn memory_pages(&self) -> u32 {
        self.runtime.lock().memory().pages()
    }

    /// Copy `len` bytes of linear memory starting at `offset`.
    pub fn read_memory(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let runtime = self.runtime.lock();
        let bytes = runtime.memory().as_slice();
        offset
            .checked_add(len)
            .and_then(|end| bytes.get(offset..end))
            .map(<[u8]>::to_vec)
    }

    pub fn stats(&self) -> JitStats {
        self.runtime.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// (func (export "f")) (global (export "g") i32 (i32.const 5)) (memory (export "memory") 1)
    fn small_module() -> Vec<u8> {
        vec![
            0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, //
            0x01, 0x04, 0x01, 0x60, 0x00, 0x00, //
            0x03, 0x02, 0x01, 0x00, //
            0x05, 0x03, 0x01, 0x00, 0x01, //
            0x06, 0x06, 0x01, 0x7F, 0x00, 0x41, 0x05, 0x0B, //
            0x07, 0x12, 0x03, //
            0x01, b'f', 0x00, 0x00, //
            0x01, b'g', 0x03, 0x00, //
            0x06, b'm', b'e', b'm', b'o', b'r', b'y', 0x02, 0x00, //
            0x0A, 0x04, 0x01, 0x02, 0x00, 0x0B,
        ]
    }

    #[test]
    fn test_invoke_checks_exports_and_arguments() {
        let instance = Instance::new(&small_module(), WaveConfig::default()).unwrap();

        assert_eq!(instance.invoke("f", &[]).unwrap(), None);
        assert!(matches!(instance.invoke("missing", &[]), Err(WaveError::Link(_))));
        assert!(matches!(instance.invoke("g", &[]), Err(WaveError::Link(_))));
        assert!(matches!(
            instance.invoke("f", &[WasmValue::I32(1)]),
            Err(WaveError::Link(_))
        ));
    }

    #[test]
    fn test_inspection() {
        let instance = Instance::new(&small_module(), WaveConfig::default()).unwrap();
        assert_eq!(instance.global(0), Some(WasmValue::I32(5)));
        assert_eq!(instance.global(1), None);
        assert_eq!(instance.memory_pages(), 1);
        assert_eq!(instance.read_memory(0, 4), Some(vec![0; 4]));
        assert_eq!(instance.read_memory(65535, 2), None);
    }

    #[test]
    fn test_reentrant_invoke_is_refused() {
        let instance = Instance::new(&small_module(), WaveConfig::default()).unwrap();
        let _held = instance.runtime.lock();
        assert!(matches!(instance.invoke("f", &[]), Err(WaveError::Resource(_))));
    }

    #[test]
    fn test_invalid_config() {
        let config = WaveConfig {
            operand_slots: 1,
            ..WaveConfig::default()
        };
        assert!(matches!(
            Instance::new(&small_module(), config),
            Err(WaveError::Resource(_))
        ));
    }
}
