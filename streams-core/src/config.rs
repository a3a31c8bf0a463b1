use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::position::MergePolicy;

const ENV_COMMIT_INTERVAL_MS: &str = "STREAMS_COMMIT_INTERVAL_MS";
const ENV_MERGE_POLICY: &str = "STREAMS_MERGE_POLICY";

/// Runtime knobs of an [Executor](crate::executor::Executor).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorConfig {
    /// When set, the execution loop commits on its own every interval. Failures of these commits
    /// go to the error handler.
    pub commit_interval: Option<Duration>,
}

/// Core settings read from the environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub executor: ExecutorConfig,
    pub merge_policy: MergePolicy,
}

impl Settings {
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _val)| [ENV_COMMIT_INTERVAL_MS, ENV_MERGE_POLICY].contains(&key.as_str()))
            .collect();

        let mut settings = Settings::default();

        if let Some(interval) = env_vars.get(ENV_COMMIT_INTERVAL_MS) {
            let millis: u64 = interval.trim().parse().map_err(|e| {
                Error::Config(format!(
                    "Invalid {ENV_COMMIT_INTERVAL_MS} value {interval:?}: {e}"
                ))
            })?;
            // zero disables the periodic commit.
            settings.executor.commit_interval =
                (millis > 0).then(|| Duration::from_millis(millis));
        }

        if let Some(policy) = env_vars.get(ENV_MERGE_POLICY) {
            settings.merge_policy = policy
                .parse()
                .map_err(|e| Error::Config(format!("Invalid {ENV_MERGE_POLICY} value: {e}")))?;
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults() {
        let settings = Settings::load(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.executor.commit_interval, None);
        assert_eq!(settings.merge_policy, MergePolicy::Lossless);
    }

    #[test]
    fn test_load_values() {
        let settings = Settings::load([
            ("STREAMS_COMMIT_INTERVAL_MS", "250"),
            ("STREAMS_MERGE_POLICY", "Dupless"),
            ("UNRELATED", "x"),
        ])
        .unwrap();

        assert_eq!(
            settings.executor.commit_interval,
            Some(Duration::from_millis(250))
        );
        assert_eq!(settings.merge_policy, MergePolicy::DuplicateAverse);
    }

    #[test]
    fn test_zero_interval_disables_periodic_commit() {
        let settings = Settings::load([("STREAMS_COMMIT_INTERVAL_MS", "0")]).unwrap();
        assert_eq!(settings.executor.commit_interval, None);
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = Settings::load([("STREAMS_COMMIT_INTERVAL_MS", "soon")]).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("STREAMS_COMMIT_INTERVAL_MS")));

        let err = Settings::load([("STREAMS_MERGE_POLICY", "newest")]).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("STREAMS_MERGE_POLICY")));
    }
}
