//! Routing task families to worker commands.
//!
//! A [`ScriptRegistry`] maps each task family to the [`CommandTemplate`]
//! that launches a worker for it. Resolution is a plain map lookup done
//! once per task; registries are built at startup (programmatically or
//! from TOML) and never mutated afterwards.
//!
//! # Invocation contract
//!
//! The dispatcher appends three arguments to the template: the script key,
//! the input channel path and the output channel path. The worker must
//! read exactly one payload from the input channel, write exactly one
//! payload to the output channel, and exit 0 on success; anything it
//! prints to stderr is captured for diagnostics.
//!
//! # TOML form
//!
//! ```toml
//! [families.cards]
//! program = "python3"
//! args = ["-m", "cardworker"]
//!
//! [families.cards.env]
//! PYTHONUNBUFFERED = "1"
//! ```

use std::collections::HashMap;

use serde::Deserialize;

/// How to launch a worker for one task family.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandTemplate {
    /// Executable to run.
    pub program: String,

    /// Fixed arguments, placed before the script key and channel paths.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the worker.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandTemplate {
    /// Creates a template with no fixed arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Sets the fixed argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    families: HashMap<String, CommandTemplate>,
}

/// Family → command template lookup, fixed after startup.
#[derive(Debug, Default)]
pub struct ScriptRegistry {
    families: HashMap<String, CommandTemplate>,
}

impl ScriptRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the template for one family, replacing any prior entry.
    pub fn register(mut self, family: impl Into<String>, template: CommandTemplate) -> Self {
        self.families.insert(family.into(), template);
        self
    }

    /// Looks up the template for `family`.
    pub fn resolve(&self, family: &str) -> Option<&CommandTemplate> {
        self.families.get(family)
    }

    /// Number of registered families.
    pub fn len(&self) -> usize {
        self.families.len()
    }

    /// Returns `true` if no family is registered.
    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Loads a registry from its TOML form.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskmill::worker::ScriptRegistry;
    ///
    /// let registry = ScriptRegistry::from_toml_str(
    ///     r#"
    ///     [families.echo]
    ///     program = "sh"
    ///     args = ["-c", "cat <\"$1\" >\"$2\""]
    ///     "#,
    /// )
    /// .unwrap();
    /// assert!(registry.resolve("echo").is_some());
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        let file: RegistryFile = toml::from_str(input)?;
        Ok(Self {
            families: file.families,
        })
    }
}
