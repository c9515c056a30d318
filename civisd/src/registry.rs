//! Active modules of a session, keyed by module name.

use civis_common::domain::Module;
use civis_common::protocol::{ModuleExecutionResult, SignalResponse};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module '{name}' is already active (id {id})")]
    ModuleAlreadyActive { name: String, id: u64 },
}

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Mutex<HashMap<String, Arc<Module>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module; at most one module per name may be active.
    pub fn add(&self, module: Arc<Module>) -> Result<(), RegistryError> {
        let mut modules = self.modules.lock().unwrap();
        if let Some(existing) = modules.get(module.name()) {
            return Err(RegistryError::ModuleAlreadyActive {
                name: module.name().to_string(),
                id: existing.id(),
            });
        }
        modules.insert(module.name().to_string(), module);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.lock().unwrap().get(name).cloned()
    }

    /// Remove the module a result belongs to and end it with that result.
    ///
    /// Results for unknown modules (or a stale id under a reused name) are
    /// acknowledged with `module_removed: false`.
    pub fn on_module_execution_result(&self, result: &ModuleExecutionResult) -> SignalResponse {
        let removed = {
            let mut modules = self.modules.lock().unwrap();
            match modules.get(&result.module_name) {
                Some(module) if module.id() == result.module_id => {
                    modules.remove(&result.module_name)
                }
                _ => None,
            }
        };
        let Some(module) = removed else {
            debug!(
                module = %result.module_name,
                id = result.module_id,
                "Result for a module that is not active"
            );
            return SignalResponse::ModuleAck {
                module_removed: false,
            };
        };
        module.end_with_result(result);
        debug!(module = %module.name(), id = module.id(), "Module finished by worker");
        SignalResponse::ModuleAck {
            module_removed: true,
        }
    }

    /// Modules still active, in id order.
    pub fn active(&self) -> Vec<Arc<Module>> {
        let modules = self.modules.lock().unwrap();
        let mut active: Vec<_> = modules.values().cloned().collect();
        active.sort_by_key(|module| module.id());
        active
    }

    pub fn len(&self) -> usize {
        self.modules.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
