//! Scoped variable storage and placeholder resolution
//!
//! A run owns one `VariableStore`: a stack of frames with the workflow
//! scope at the bottom and loop / sub-workflow frames above it. Reads walk
//! top to bottom; writes go to the nearest frame owning the name, else the
//! workflow scope.
//!
//! Template resolution (`"{{name}} items"`) is the hot path during
//! parameter assembly, so resolved templates are memoised against a store
//! version that every write bumps.

use std::collections::HashMap;

use casare_workflow::{Value, VariableDef};

use crate::error::{EngineError, Result};

/// What opened a scope frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// The bottom frame, always present
    Workflow,
    /// A loop body frame holding the current item/index
    Loop,
    /// A sub-workflow call frame
    SubWorkflow,
}

#[derive(Debug)]
struct ScopeFrame {
    kind: ScopeKind,
    vars: HashMap<String, Value>,
}

/// Hierarchical variable store for one run
#[derive(Debug)]
pub struct VariableStore {
    frames: Vec<ScopeFrame>,
    /// template -> (version it was resolved at, resolved value)
    cache: HashMap<String, (u64, Value)>,
    version: u64,
}

impl VariableStore {
    /// Create a store with only the workflow scope
    pub fn new() -> Self {
        Self {
            frames: vec![ScopeFrame {
                kind: ScopeKind::Workflow,
                vars: HashMap::new(),
            }],
            cache: HashMap::new(),
            version: 0,
        }
    }

    /// Create a store seeded from workflow variable declarations
    pub fn from_definitions(defs: &[VariableDef]) -> Self {
        let mut store = Self::new();
        for def in defs {
            store.set(&def.name, Value::from_json(&def.value));
        }
        store
    }

    /// Read a variable, walking the scope stack top to bottom
    pub fn get(&self, name: &str) -> Result<Value> {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.vars.get(name) {
                return Ok(value.clone());
            }
        }
        Err(EngineError::UndefinedVariable {
            name: name.to_string(),
        })
    }

    /// Whether any frame binds the name
    pub fn contains(&self, name: &str) -> bool {
        self.frames.iter().any(|f| f.vars.contains_key(name))
    }

    /// Write a variable.
    ///
    /// Updates the nearest frame that already owns the name, else the
    /// workflow scope. Returns the previous value, if any.
    pub fn set(&mut self, name: &str, value: Value) -> Option<Value> {
        self.version += 1;
        for frame in self.frames.iter_mut().rev() {
            if let Some(slot) = frame.vars.get_mut(name) {
                return Some(std::mem::replace(slot, value));
            }
        }
        self.frames[0].vars.insert(name.to_string(), value)
    }

    /// Declare a variable in the current (topmost) frame, shadowing any
    /// binding below
    pub fn declare(&mut self, name: &str, value: Value) {
        self.version += 1;
        if let Some(frame) = self.frames.last_mut() {
            frame.vars.insert(name.to_string(), value);
        }
    }

    /// Open a new scope frame
    pub fn push_scope(&mut self, kind: ScopeKind) {
        self.frames.push(ScopeFrame {
            kind,
            vars: HashMap::new(),
        });
    }

    /// Close the topmost frame. The workflow scope is never popped.
    pub fn pop_scope(&mut self) {
        if self.frames.len() > 1 {
            self.version += 1;
            self.frames.pop();
        }
    }

    /// Kind of the topmost frame
    pub fn current_scope(&self) -> ScopeKind {
        self.frames.last().map(|f| f.kind).unwrap_or(ScopeKind::Workflow)
    }

    /// Depth of the scope stack (1 = workflow scope only)
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Snapshot of every visible binding, innermost shadowing outermost
    pub fn snapshot(&self) -> HashMap<String, Value> {
        let mut all = HashMap::new();
        for frame in &self.frames {
            for (name, value) in &frame.vars {
                all.insert(name.clone(), value.clone());
            }
        }
        all
    }

    /// Resolve a template containing `{{identifier}}` placeholders.
    ///
    /// When the whole template is exactly one placeholder the bound value
    /// is returned natively; otherwise placeholders are interpolated into
    /// a string. Unknown placeholders fail with `UndefinedVariable`.
    pub fn resolve(&mut self, template: &str) -> Result<Value> {
        if !template.contains("{{") {
            return Ok(Value::Str(template.to_string()));
        }
        if let Some((cached_version, value)) = self.cache.get(template) {
            if *cached_version == self.version {
                return Ok(value.clone());
            }
        }
        let resolved = self.resolve_uncached(template)?;
        self.cache
            .insert(template.to_string(), (self.version, resolved.clone()));
        Ok(resolved)
    }

    fn resolve_uncached(&self, template: &str) -> Result<Value> {
        // Whole-template placeholder keeps the native type
        let trimmed = template.trim();
        if let Some(name) = single_placeholder(trimmed) {
            return self.get(name);
        }

        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                // Unterminated placeholder renders literally
                out.push_str(&rest[open..]);
                rest = "";
                break;
            };
            let name = after[..close].trim();
            out.push_str(&self.get(name)?.render());
            rest = &after[close + 2..];
        }
        out.push_str(rest);
        Ok(Value::Str(out))
    }
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

/// If the whole string is one `{{name}}` placeholder, return the name
fn single_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    let name = inner.trim();
    if name.is_empty() || name.contains("{{") || name.contains("}}") {
        return None;
    }
    Some(name)
}
