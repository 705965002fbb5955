use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Resolves `$(NAME)` in symlink targets.  Tests inject a fixed mapping;
/// production uses the process environment.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub fn process_env_lookup() -> EnvLookup {
    Arc::new(|name: &str| std::env::var(name).ok())
}

/// Engine-wide options.  Pre-2.1 catalogs store no uid/gid columns; rows
/// decoded from them get these defaults.
#[derive(Clone, Serialize, Deserialize)]
pub struct CatalogOptions {
    pub legacy_uid: u32,
    pub legacy_gid: u32,
    #[serde(skip, default = "process_env_lookup")]
    pub env_lookup: EnvLookup,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            legacy_uid: 0,
            legacy_gid: 0,
            env_lookup: process_env_lookup(),
        }
    }
}

impl std::fmt::Debug for CatalogOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogOptions")
            .field("legacy_uid", &self.legacy_uid)
            .field("legacy_gid", &self.legacy_gid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lookup_reads_process_env() {
        std::env::set_var("CATALOG_LIB_CONFIG_TEST", "yes");
        let opts = CatalogOptions::default();
        assert_eq!(
            (opts.env_lookup)("CATALOG_LIB_CONFIG_TEST").as_deref(),
            Some("yes")
        );
        assert_eq!((opts.env_lookup)("CATALOG_LIB_CONFIG_UNSET_TEST"), None);
    }
}
