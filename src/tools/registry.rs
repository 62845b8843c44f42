//! Tool registry for managing available tools.
//!
//! The table is copy-on-write: writers clone the current table, apply their
//! change to the clone and publish it by swapping one `Arc`. A lookup holds
//! the read lock only long enough to clone that `Arc`, so a handler that is
//! already executing keeps its table alive no matter what gets registered
//! afterwards.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::error::RegistryError;
use crate::tools::tool::{Tool, ToolOrigin};

#[derive(Clone)]
struct Entry {
    tool: Arc<dyn Tool>,
    origin: ToolOrigin,
}

/// An immutable view of the registry at one generation.
#[derive(Clone, Default)]
pub struct ToolTable {
    entries: HashMap<String, Entry>,
    generation: u64,
}

impl ToolTable {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entries.get(name).map(|e| Arc::clone(&e.tool))
    }

    pub fn origin(&self, name: &str) -> Option<ToolOrigin> {
        self.entries.get(name).map(|e| e.origin)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Introspection entry returned by [`ToolRegistry::describe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub origin: ToolOrigin,
    pub description: String,
}

/// Registry of available tools.
pub struct ToolRegistry {
    table: RwLock<Arc<ToolTable>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(ToolTable::default())),
        }
    }

    /// Current table. Cheap; never blocks on a writer for longer than a pointer swap.
    pub fn snapshot(&self) -> Arc<ToolTable> {
        let guard = self.table.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*guard)
    }

    fn publish<F, T>(&self, change: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut ToolTable) -> Result<T, RegistryError>,
    {
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = ToolTable::clone(&guard);
        let out = change(&mut next)?;
        next.generation = guard.generation + 1;
        *guard = Arc::new(next);
        Ok(out)
    }

    /// Register a built-in tool, replacing any entry with the same name.
    pub fn register_builtin(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let result = self.publish(|table| {
            table.entries.insert(
                name.clone(),
                Entry {
                    tool,
                    origin: ToolOrigin::Builtin,
                },
            );
            Ok(())
        });
        debug_assert!(result.is_ok());
        tracing::debug!(tool = %name, "Registered built-in tool");
    }

    /// Register a deployed tool. Overwrites a previously deployed tool of the
    /// same name and returns `true` in that case; built-ins cannot be replaced.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<bool, RegistryError> {
        let name = tool.name().to_string();
        let replaced = self.publish(|table| {
            if table.origin(&name) == Some(ToolOrigin::Builtin) {
                return Err(RegistryError::Reserved { name: name.clone() });
            }
            let previous = table.entries.insert(
                name.clone(),
                Entry {
                    tool,
                    origin: ToolOrigin::Deployed,
                },
            );
            Ok(previous.is_some())
        })?;
        tracing::info!(tool = %name, replaced, "Registered deployed tool");
        Ok(replaced)
    }

    /// Remove a deployed tool.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Tool>, RegistryError> {
        let removed = self.publish(|table| match table.origin(name) {
            None => Err(RegistryError::NotFound {
                name: name.to_string(),
            }),
            Some(ToolOrigin::Builtin) => Err(RegistryError::Reserved {
                name: name.to_string(),
            }),
            Some(ToolOrigin::Deployed) => table
                .entries
                .remove(name)
                .map(|e| e.tool)
                .ok_or_else(|| RegistryError::NotFound {
                    name: name.to_string(),
                }),
        })?;
        tracing::info!(tool = %name, "Unregistered tool");
        Ok(removed)
    }

    /// Look up a tool by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.snapshot().get(name)
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.snapshot().origin(name) == Some(ToolOrigin::Builtin)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Name, origin and description of every tool, sorted by name.
    pub fn describe(&self) -> Vec<ToolInfo> {
        let table = self.snapshot();
        let mut infos: Vec<ToolInfo> = table
            .entries
            .iter()
            .map(|(name, e)| ToolInfo {
                name: name.clone(),
                origin: e.origin,
                description: e.tool.description().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn count(&self) -> usize {
        self.snapshot().len()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
