// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for cascade.
//!
//! Configuration is read from TOML files and layered with the [`config`] crate: the defaults in
//! `default-config.toml` are the base layer, and a repository's `.config/cascade.toml` is merged
//! on top of them. Most settings are managed through [profiles](CascadeProfile).

use crate::errors::{
    ConfigParseError, ConfigParseErrorKind, ProfileNotFound, ThreadCountParseError,
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{cmp::Ordering, collections::HashMap, fmt, str::FromStr, sync::LazyLock, time::Duration};
use tracing::warn;

/// Gets the number of available CPUs, falling back to 1 if it can't be determined.
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Overall configuration for cascade.
#[derive(Clone, Debug)]
pub struct CascadeConfig {
    workspace_root: Utf8PathBuf,
    inner: CascadeConfigImpl,
}

impl CascadeConfig {
    /// The default location of the config within the workspace: `.config/cascade.toml`.
    pub const CONFIG_PATH: &'static str = ".config/cascade.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the config from the given file, or if not specified from `.config/cascade.toml` in
    /// the workspace root.
    ///
    /// If no config file is specified and the workspace doesn't have `.config/cascade.toml`, the
    /// default config is used.
    pub fn from_sources(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let workspace_root = workspace_root.into();

        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = workspace_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let inner = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(config_file, kind))?;

        Ok(Self {
            workspace_root,
            inner,
        })
    }

    /// Parses the config from a TOML string layered on top of the defaults.
    ///
    /// `origin` is used for error reporting only.
    pub fn from_toml_str(
        workspace_root: impl Into<Utf8PathBuf>,
        origin: impl Into<Utf8PathBuf>,
        contents: &str,
    ) -> Result<Self, ConfigParseError> {
        let builder =
            Self::make_default_config().add_source(File::from_str(contents, FileFormat::Toml));
        let inner = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(origin, kind))?;
        Ok(Self {
            workspace_root: workspace_root.into(),
            inner,
        })
    }

    /// Returns the default cascade config.
    pub fn default_config(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        let inner = Self::build_and_deserialize_config(&Self::make_default_config())
            .unwrap_or_else(|err| panic!("default config is always valid: {err}"));
        Self {
            workspace_root: workspace_root.into(),
            inner,
        }
    }

    /// Returns the workspace root this config was read for.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the profile with the given name, or an error if a profile was specified but not
    /// found.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<CascadeProfile<'_>, ProfileNotFound> {
        let name = name.as_ref();
        let custom_profile = self.inner.profiles.get(name)?;

        let mut store_dir = self.workspace_root.join(&self.inner.store.dir);
        store_dir.push(name);

        Ok(CascadeProfile {
            name: name.to_owned(),
            store_dir,
            default_profile: &self.inner.profiles.default,
            custom_profile,
        })
    }

    // ---
    // Helper methods
    // ---

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<CascadeConfigImpl, ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        serde_path_to_error::deserialize(config)
            .map_err(|error| ConfigParseErrorKind::DeserializeError(Box::new(error)))
    }
}

/// A configuration profile for cascade. Contains most configuration used by the runner.
///
/// Returned by [`CascadeConfig::profile`].
#[derive(Clone, Debug)]
pub struct CascadeProfile<'cfg> {
    name: String,
    store_dir: Utf8PathBuf,
    default_profile: &'cfg DefaultProfileImpl,
    custom_profile: Option<&'cfg CustomProfileImpl>,
}

impl<'cfg> CascadeProfile<'cfg> {
    /// Returns the name of this profile.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the absolute profile-specific store directory.
    pub fn store_dir(&self) -> &Utf8Path {
        &self.store_dir
    }

    /// Returns the number of projects to build simultaneously.
    pub fn build_threads(&self) -> ThreadCount {
        self.custom_profile
            .and_then(|profile| profile.build_threads)
            .unwrap_or(self.default_profile.build_threads)
    }

    /// Returns the number of test processes to run simultaneously.
    pub fn test_threads(&self) -> ThreadCount {
        self.custom_profile
            .and_then(|profile| profile.test_threads)
            .unwrap_or(self.default_profile.test_threads)
    }

    /// Returns the timeout applied to test cases that don't declare one.
    pub fn timeout(&self) -> Duration {
        self.custom_profile
            .and_then(|profile| profile.timeout)
            .unwrap_or(self.default_profile.timeout)
    }

    /// Returns the time between the termination request and the forced kill of a timed-out
    /// process.
    pub fn grace_period(&self) -> Duration {
        self.custom_profile
            .and_then(|profile| profile.grace_period)
            .unwrap_or(self.default_profile.grace_period)
    }

    /// Returns the time after which a child process that hasn't closed its handles is marked as
    /// leaky.
    pub fn leak_timeout(&self) -> Duration {
        self.custom_profile
            .and_then(|profile| profile.leak_timeout)
            .unwrap_or(self.default_profile.leak_timeout)
    }

    /// Returns how skipped projects are accounted for.
    pub fn skip_policy(&self) -> SkipPolicy {
        self.custom_profile
            .and_then(|profile| profile.skip_policy)
            .unwrap_or(self.default_profile.skip_policy)
    }

    /// Returns the JUnit configuration for this profile, if a JUnit path is set.
    pub fn junit(&self) -> Option<JunitConfig<'cfg>> {
        let path = self
            .custom_profile
            .and_then(|profile| profile.junit.path.as_deref())
            .or(self.default_profile.junit.path.as_deref())?;

        let report_name = self
            .custom_profile
            .and_then(|profile| profile.junit.report_name.as_deref())
            .unwrap_or(&self.default_profile.junit.report_name);

        Some(JunitConfig {
            path: self.store_dir.join(path),
            report_name,
        })
    }
}

/// JUnit configuration, returned by a [`CascadeProfile`].
#[derive(Clone, Debug)]
pub struct JunitConfig<'cfg> {
    path: Utf8PathBuf,
    report_name: &'cfg str,
}

impl<'cfg> JunitConfig<'cfg> {
    /// Creates a new JUnit configuration.
    pub fn new(path: impl Into<Utf8PathBuf>, report_name: &'cfg str) -> Self {
        Self {
            path: path.into(),
            report_name,
        }
    }

    /// Returns the absolute path to the JUnit report.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns the name of the JUnit report.
    pub fn report_name(&self) -> &'cfg str {
        self.report_name
    }
}

/// How projects that won't be built because of a failed dependency are accounted for.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipPolicy {
    /// Skips are recorded as soon as the failure is known, without occupying a build slot.
    #[default]
    Immediate,

    /// Each skip occupies a build slot, just like a build would.
    ConsumeSlot,
}

/// Type for the `build-threads` and `test-threads` config keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadCount {
    /// Run with a specified number of threads.
    Count(usize),

    /// Run with a number of threads equal to the logical CPU count.
    NumCpus,
}

impl ThreadCount {
    /// Gets the actual number of threads computed at runtime.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(threads) => threads,
            Self::NumCpus => get_num_cpus(),
        }
    }
}

impl FromStr for ThreadCount {
    type Err = ThreadCountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "num-cpus" {
            return Ok(Self::NumCpus);
        }

        match s.parse::<isize>() {
            Err(e) => Err(ThreadCountParseError::new(format!("{s} ({e})"))),
            Ok(0) => Err(ThreadCountParseError::new("0 (thread count may not be 0)")),
            Ok(j) if j < 0 => Ok(ThreadCount::Count(
                (get_num_cpus() as isize + j).max(1) as usize,
            )),
            Ok(j) => Ok(ThreadCount::Count(j as usize)),
        }
    }
}

impl fmt::Display for ThreadCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(threads) => write!(f, "{threads}"),
            Self::NumCpus => write!(f, "num-cpus"),
        }
    }
}

impl<'de> Deserialize<'de> for ThreadCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = ThreadCount;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "an integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == "num-cpus" {
                    Ok(ThreadCount::NumCpus)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    ))
                }
            }

            // Note that TOML uses i64, not u64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match v.cmp(&0) {
                    Ordering::Greater => Ok(ThreadCount::Count(v as usize)),
                    Ordering::Less => Ok(ThreadCount::Count(
                        (get_num_cpus() as i64 + v).max(1) as usize,
                    )),
                    Ordering::Equal => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Signed(v),
                        &self,
                    )),
                }
            }

            // The config crate may hand integers over as u64.
            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == 0 {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Unsigned(v),
                        &self,
                    ))
                } else {
                    Ok(ThreadCount::Count(v as usize))
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CascadeConfigImpl {
    store: StoreConfigImpl,
    #[serde(rename = "profile")]
    profiles: CascadeProfilesImpl,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StoreConfigImpl {
    dir: Utf8PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CascadeProfilesImpl {
    default: DefaultProfileImpl,
    #[serde(flatten)]
    other: HashMap<String, CustomProfileImpl>,
}

impl CascadeProfilesImpl {
    fn get(&self, profile: &str) -> Result<Option<&CustomProfileImpl>, ProfileNotFound> {
        let custom_profile = match profile {
            CascadeConfig::DEFAULT_PROFILE => None,
            other => Some(
                self.other
                    .get(other)
                    .ok_or_else(|| ProfileNotFound::new(profile, self.all_profiles()))?,
            ),
        };
        Ok(custom_profile)
    }

    fn all_profiles(&self) -> impl Iterator<Item = &str> {
        self.other
            .keys()
            .map(|key| key.as_str())
            .chain(std::iter::once(CascadeConfig::DEFAULT_PROFILE))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DefaultProfileImpl {
    build_threads: ThreadCount,
    test_threads: ThreadCount,
    #[serde(with = "humantime_serde")]
    timeout: Duration,
    #[serde(with = "humantime_serde")]
    grace_period: Duration,
    #[serde(with = "humantime_serde")]
    leak_timeout: Duration,
    skip_policy: SkipPolicy,
    junit: DefaultJunitImpl,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DefaultJunitImpl {
    #[serde(default)]
    path: Option<Utf8PathBuf>,
    report_name: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomProfileImpl {
    #[serde(default)]
    build_threads: Option<ThreadCount>,
    #[serde(default)]
    test_threads: Option<ThreadCount>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    grace_period: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    leak_timeout: Option<Duration>,
    #[serde(default)]
    skip_policy: Option<SkipPolicy>,
    #[serde(default)]
    junit: CustomJunitImpl,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomJunitImpl {
    #[serde(default)]
    path: Option<Utf8PathBuf>,
    #[serde(default)]
    report_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use indoc::indoc;
    use test_case::test_case;

    #[test]
    fn default_config_is_valid() {
        let config = CascadeConfig::default_config("/fake/root");
        let profile = config
            .profile(CascadeConfig::DEFAULT_PROFILE)
            .expect("default profile exists");
        assert_eq!(profile.build_threads(), ThreadCount::NumCpus);
        assert_eq!(profile.test_threads(), ThreadCount::NumCpus);
        assert_eq!(profile.timeout(), Duration::from_secs(20));
        assert_eq!(profile.grace_period(), Duration::from_secs(5));
        assert_eq!(profile.leak_timeout(), Duration::from_millis(100));
        assert_eq!(profile.skip_policy(), SkipPolicy::Immediate);
        assert!(profile.junit().is_none(), "junit is off by default");
        assert_eq!(
            profile.store_dir(),
            Utf8Path::new("/fake/root/target/cascade/default")
        );
    }

    #[test]
    fn custom_profile_falls_back_to_default() {
        let contents = indoc! {r#"
            [profile.default]
            timeout = "30s"

            [profile.ci]
            test-threads = 2
            skip-policy = "consume-slot"
            junit.path = "junit.xml"
        "#};
        let config = CascadeConfig::from_toml_str("/fake/root", "cascade.toml", contents)
            .expect("config is valid");

        let ci = config.profile("ci").expect("ci profile exists");
        assert_eq!(ci.test_threads(), ThreadCount::Count(2));
        assert_eq!(ci.skip_policy(), SkipPolicy::ConsumeSlot);
        // Inherited from the overridden default profile.
        assert_eq!(ci.timeout(), Duration::from_secs(30));
        assert_eq!(ci.build_threads(), ThreadCount::NumCpus);

        let junit = ci.junit().expect("junit is configured for ci");
        assert_eq!(
            junit.path(),
            Utf8Path::new("/fake/root/target/cascade/ci/junit.xml")
        );
        assert_eq!(junit.report_name(), "cascade-run");

        let default = config.profile("default").expect("default profile exists");
        assert!(default.junit().is_none());
    }

    #[test]
    fn unknown_profile() {
        let config = CascadeConfig::default_config("/fake/root");
        let err = config.profile("nope").expect_err("profile doesn't exist");
        assert_eq!(
            err.to_string(),
            "profile `nope` not found (known profiles: default)"
        );
    }

    #[test]
    fn config_file_in_workspace() {
        let workspace_dir = tempdir().unwrap();
        let config_dir = workspace_dir.path().join(".config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("cascade.toml"),
            indoc! {r#"
                [profile.default]
                grace-period = "250ms"
            "#},
        )
        .unwrap();

        let config = CascadeConfig::from_sources(workspace_dir.path(), None).unwrap();
        let profile = config.profile("default").unwrap();
        assert_eq!(profile.grace_period(), Duration::from_millis(250));
    }

    #[test]
    fn missing_workspace_config_uses_defaults() {
        let workspace_dir = tempdir().unwrap();
        let config = CascadeConfig::from_sources(workspace_dir.path(), None).unwrap();
        let profile = config.profile("default").unwrap();
        assert_eq!(profile.timeout(), Duration::from_secs(20));
    }

    #[test]
    fn invalid_value_reports_path() {
        let contents = indoc! {r#"
            [profile.default]
            skip-policy = "sometimes"
        "#};
        let err = CascadeConfig::from_toml_str("/fake/root", "cascade.toml", contents)
            .expect_err("skip-policy is invalid");
        match err.kind() {
            ConfigParseErrorKind::DeserializeError(error) => {
                let message = error.inner().to_string();
                assert!(
                    message.contains("sometimes"),
                    "expected message \"{message}\" to mention the invalid value"
                );
            }
            other => panic!("unexpected error kind: {other:?}"),
        }
    }

    #[test_case(
        indoc! {r#"
            [profile.custom]
            test-threads = -1
        "#},
        Some(get_num_cpus().saturating_sub(1).max(1))

        ; "negative"
    )]
    #[test_case(
        indoc! {r#"
            [profile.custom]
            test-threads = 2
        "#},
        Some(2)

        ; "positive"
    )]
    #[test_case(
        indoc! {r#"
            [profile.custom]
            test-threads = 0
        "#},
        None

        ; "zero"
    )]
    #[test_case(
        indoc! {r#"
            [profile.custom]
            test-threads = "num-cpus"
        "#},
        Some(get_num_cpus())

        ; "num-cpus"
    )]
    fn parse_test_threads(config_contents: &str, n_threads: Option<usize>) {
        let config = CascadeConfig::from_toml_str("/fake/root", "cascade.toml", config_contents);
        match n_threads {
            None => assert!(config.is_err()),
            Some(n) => assert_eq!(
                config
                    .unwrap()
                    .profile("custom")
                    .unwrap()
                    .test_threads()
                    .compute(),
                n,
            ),
        }
    }

    #[test_case("num-cpus", Some(ThreadCount::NumCpus); "num cpus")]
    #[test_case("4", Some(ThreadCount::Count(4)); "positive")]
    #[test_case("0", None; "zero")]
    #[test_case("lots", None; "not a number")]
    fn thread_count_from_str(input: &str, expected: Option<ThreadCount>) {
        assert_eq!(input.parse::<ThreadCount>().ok(), expected);
    }
}
