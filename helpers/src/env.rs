use std::{
    collections::HashMap,
    env::{self, VarError},
};

/// Provides a wrapper around variables provided by the current
/// environment so that configuration loading can be exercised against
/// fixed variable sets.
pub trait EnvVars: Send + Sync {
    /// Fetches the environment variable `key` from the current process
    /// or equivalent environment.
    fn var(&self, key: &str) -> Result<String, VarError>;

    /// Clones the environment variables, this will usually be a shallow
    /// clone used to share references to the environment variables
    /// provider.
    fn clone_env_vars(&self) -> Box<dyn EnvVars>;
}

/// Environment variables sourced from the current process.
pub struct ProcessEnvVars {}

impl ProcessEnvVars {
    pub fn new() -> Self {
        ProcessEnvVars {}
    }
}

impl Default for ProcessEnvVars {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvVars for ProcessEnvVars {
    fn var(&self, key: &str) -> Result<String, VarError> {
        env::var(key)
    }

    fn clone_env_vars(&self) -> Box<dyn EnvVars> {
        Box::new(ProcessEnvVars {})
    }
}

/// A fixed set of environment variables, for tests and for embedding
/// the runtime with programmatic configuration.
#[derive(Clone, Default)]
pub struct StaticEnvVars {
    vars: HashMap<String, String>,
}

impl StaticEnvVars {
    pub fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            vars: entries
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }
    }
}

impl EnvVars for StaticEnvVars {
    fn var(&self, key: &str) -> Result<String, VarError> {
        self.vars.get(key).cloned().ok_or(VarError::NotPresent)
    }

    fn clone_env_vars(&self) -> Box<dyn EnvVars> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn EnvVars> {
    fn clone(&self) -> Self {
        self.clone_env_vars()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_static_env_vars_return_only_known_entries() {
        let env = StaticEnvVars::new(&[("OUTPOST_DEPLOYMENT_ID", "prod")]);

        assert_eq!(
            env.var("OUTPOST_DEPLOYMENT_ID"),
            Ok("prod".to_string())
        );
        assert_eq!(env.var("OUTPOST_TOPICS"), Err(VarError::NotPresent));
    }
}
