//! Script-level macro variables. A definition is a parameterized body
//! template; invocations (`${Name:arg1,arg2}`) substitute arguments
//! into the body, which the compiler then re-compiles in place.
//! Immutable after load.

use crate::errors::CompileError;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::warn;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap())
}

#[derive(Debug, Clone, Deserialize)]
pub struct MacroVariableDefinition {
    pub name: String,
    /// Body text, possibly multiple statements separated by newlines,
    /// with `{param}` placeholders.
    pub body: String,
    /// Declared parameter names, inferred from the body placeholders in
    /// first-appearance order.
    #[serde(skip)]
    pub params: Vec<String>,
}

impl MacroVariableDefinition {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        let mut def = Self {
            name: name.into(),
            body,
            params: Vec::new(),
        };
        def.infer_params();
        def
    }

    fn infer_params(&mut self) {
        let mut seen = Vec::new();
        for caps in placeholder_re().captures_iter(&self.body) {
            let p = caps[1].to_string();
            if !seen.contains(&p) {
                seen.push(p);
            }
        }
        self.params = seen;
    }

    /// Substitutes positional arguments into the body by declared
    /// parameter order. A missing argument leaves its placeholder in
    /// place and logs a warning; it is not a compile failure.
    pub fn substitute(&self, args: &[String]) -> String {
        let mut out = self.body.clone();
        for (i, param) in self.params.iter().enumerate() {
            let placeholder = format!("{{{param}}}");
            match args.get(i) {
                Some(value) => out = out.replace(&placeholder, value),
                None => {
                    warn!(
                        variable = %self.name,
                        parameter = %param,
                        "missing argument for macro parameter, placeholder left in place"
                    );
                }
            }
        }
        out
    }
}

/// Registry of macro definitions for one script context. Lookup is
/// case-insensitive; the registry is read-only after construction.
#[derive(Debug, Default)]
pub struct VariableRegistry {
    defs: HashMap<String, MacroVariableDefinition>,
}

impl VariableRegistry {
    pub fn new(definitions: Vec<MacroVariableDefinition>) -> Self {
        let mut defs = HashMap::new();
        for mut def in definitions {
            def.infer_params();
            defs.insert(def.name.to_lowercase(), def);
        }
        Self { defs }
    }

    /// Loads definitions from a JSON array of `{name, body}` objects.
    pub fn load(path: &Path) -> Result<Self, CompileError> {
        let content = std::fs::read_to_string(path).map_err(|e| CompileError::Malformed {
            line: 0,
            message: format!("cannot read variable definitions: {e}"),
        })?;
        let raw: Vec<MacroVariableDefinition> =
            serde_json::from_str(&content).map_err(|e| CompileError::Malformed {
                line: 0,
                message: format!("invalid variable definitions: {e}"),
            })?;
        Ok(Self::new(raw))
    }

    pub fn get(&self, name: &str) -> Option<&MacroVariableDefinition> {
        self.defs.get(&name.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}
