//! Configuration loading for the strand runtime.
//!
//! Configuration can be layered from YAML files, JSON files, and prefixed environment variables, with later sources
//! taking precedence over earlier ones. Values are then queried by dotted key (`transport.max_frame_len`) through
//! [`GenericConfiguration`], and each runtime component builds its own typed settings from it.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use strand_error::GenericError;
use tracing::debug;

mod provider;
use self::provider::{FileFormat, FileProvider};

/// Errors raised while loading or querying configuration.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// `from_environment` was called with an empty prefix.
    #[snafu(display("An environment prefix such as `STRAND` is required."))]
    EmptyPrefix,

    /// No source provided a value for the key.
    #[snafu(display("No value for '{}'. {}", field, help_text))]
    MissingField {
        /// Lists the keys and environment variables that would have provided the value.
        help_text: String,

        /// The key that was looked up.
        field: Cow<'static, str>,
    },

    /// A value was present but could not be deserialized into the requested type.
    #[snafu(display(
        "Value for '{}' should be {}, found {}.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Dotted key of the value.
        field: String,

        /// What the caller asked for.
        expected_ty: String,

        /// What the source contained.
        actual_ty: String,
    },

    /// Any other failure, such as an unreadable file or an invalid value.
    #[snafu(display("Failed to query configuration: {}", source))]
    Generic {
        /// Underlying error.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        match e.kind {
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => Self::Generic { source: e.into() },
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum LookupSource {
    Environment { prefix: String },
}

impl LookupSource {
    fn transform_key(&self, key: &str) -> String {
        match self {
            // The prefix is already uppercased with a trailing underscore.
            LookupSource::Environment { prefix } => format!("{}{}", prefix, key.replace('.', "_").to_uppercase()),
        }
    }
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// Builds a layered configuration.
///
/// Each `from_*` call adds a source on top of the ones before it, so a later source wins when two provide the same key.
/// The bridge binary, for example, layers an optional YAML file under `STRAND_` environment variables. Environment
/// variables are only read with a prefix (see [`from_environment`][Self::from_environment]).
#[derive(Default)]
pub struct ConfigurationLoader {
    lookup_sources: HashSet<LookupSource>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Adds a YAML file.
    ///
    /// # Errors
    ///
    /// If the file is missing, unreadable, or not valid YAML, an error is returned.
    pub fn from_yaml<P>(self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        self.add_file(path, FileFormat::Yaml)
    }

    /// Adds a YAML file if it can be read. Failures are logged at debug level and skipped.
    pub fn try_from_yaml<P>(self, path: P) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        self.try_add_file(path, FileFormat::Yaml)
    }

    /// Adds a JSON file.
    ///
    /// # Errors
    ///
    /// If the file is missing, unreadable, or not valid JSON, an error is returned.
    pub fn from_json<P>(self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        self.add_file(path, FileFormat::Json)
    }

    /// Adds a JSON file if it can be read. Failures are logged at debug level and skipped.
    pub fn try_from_json<P>(self, path: P) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        self.try_add_file(path, FileFormat::Json)
    }

    fn add_file<P>(mut self, path: P, format: FileFormat) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let provider = FileProvider::from_path(&path, format)
            .map_err(GenericError::from)
            .context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    fn try_add_file<P>(mut self, path: P, format: FileFormat) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        match FileProvider::from_path(&path, format) {
            Ok(provider) => self.providers.push(BoxedProvider(Box::new(provider))),
            Err(e) => {
                debug!(
                    error = %e,
                    file_path = %path.as_ref().to_string_lossy(),
                    ?format,
                    "Unable to read configuration file. Ignoring."
                );
            }
        }
        self
    }

    /// Adds an in-memory value as a configuration source.
    ///
    /// Useful for layering programmatic defaults underneath files and environment variables.
    pub fn from_serialized<T>(mut self, values: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.providers.push(BoxedProvider(Box::new(Serialized::defaults(values))));
        self
    }

    /// Adds every environment variable that starts with `prefix`.
    ///
    /// The prefix is uppercased and gets a trailing underscore if it lacks one, so `strand` matches `STRAND_LOG_LEVEL`.
    /// The prefix is stripped and the rest of the name is lowercased to form the key (`log_level`). Variables are
    /// snapshotted when this is called.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the environment cannot be read, an error is returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // `Env` isn't `Send + Sync`, so snapshot the matched variables instead of keeping the provider around.
        let values = Env::prefixed(&prefix).data()?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(default_dict.clone()))));
            self.lookup_sources.insert(LookupSource::Environment { prefix });
        }
        Ok(self)
    }

    /// Merges every source and deserializes the result as `T`.
    ///
    /// # Errors
    ///
    /// If the merged values do not fit `T`, an error is returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.merged().extract().map_err(Into::into)
    }

    /// Merges every source into a [`GenericConfiguration`] for keyed lookups.
    pub fn into_generic(self) -> GenericConfiguration {
        let figment = self.merged();
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment,
                lookup_sources: self.lookup_sources,
            }),
        }
    }

    fn merged(&self) -> Figment {
        self.providers
            .iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider))
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    lookup_sources: HashSet<LookupSource>,
}

/// A generic configuration object.
///
/// Keys are in the form of `a.b.c`, where periods (`.`) indicate a nested value. Environment variables cannot express
/// nesting, so a lookup of `a.b.c` that misses falls back to `a_b_c`, which is the shape a `STRAND_A_B_C` variable
/// takes once its prefix is stripped.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    /// Creates an empty configuration, where every lookup misses.
    pub fn empty() -> Self {
        ConfigurationLoader::default().into_generic()
    }

    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) => {
                if matches!(e.kind, Kind::MissingField(_)) {
                    let fallback_key = key.replace('.', "_");
                    self.inner
                        .figment
                        .extract_inner(&fallback_key)
                        .map_err(|fallback_e| from_figment_error(&self.inner.lookup_sources, fallback_e))
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Looks up `key` and deserializes it as `T`.
    ///
    /// # Errors
    ///
    /// If no source has the key, or its value does not fit `T`, an error is returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Looks up `key`, falling back to `T::default()` when it is missing or does not fit `T`.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Looks up `key`, returning `None` when no source has it.
    ///
    /// Components use this to keep their defaults for keys that were not set.
    ///
    /// # Errors
    ///
    /// If the key is present but its value does not fit `T`, an error is returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the whole configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the merged values do not fit `T`, an error is returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| from_figment_error(&self.inner.lookup_sources, e))
    }
}

fn from_figment_error(lookup_sources: &HashSet<LookupSource>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = lookup_sources
                .iter()
                .map(|source| source.transform_key(&field))
                .collect::<Vec<_>>();
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use serde::Deserialize;

    use super::*;

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn nested_lookup_from_yaml() {
        let file = yaml_file("transport:\n  tcp_backlog: 32\n  multicast_group: 239.1.2.3\n");
        let config = ConfigurationLoader::default().from_yaml(file.path()).unwrap().into_generic();

        assert_eq!(config.get_typed::<u32>("transport.tcp_backlog").unwrap(), 32);
        assert_eq!(
            config.get_typed::<String>("transport.multicast_group").unwrap(),
            "239.1.2.3"
        );
        assert_eq!(config.try_get_typed::<u64>("transport.max_frame_len").unwrap(), None);
    }

    #[test]
    fn missing_field_help_mentions_environment_key() {
        std::env::set_var("STRANDCFGTEST_UNRELATED", "1");
        let config = ConfigurationLoader::default()
            .from_environment("strandcfgtest")
            .unwrap()
            .into_generic();

        match config.get_typed::<u32>("supervisor.max_restarts") {
            Err(ConfigurationError::MissingField { help_text, .. }) => {
                assert!(help_text.contains("STRANDCFGTEST_SUPERVISOR_MAX_RESTARTS"), "{}", help_text);
            }
            other => panic!("expected missing field, got {:?}", other),
        }
    }

    #[test]
    fn nested_key_falls_back_to_environment_name() {
        let file = yaml_file("transport:\n  tcp_backlog: 16\n");
        std::env::set_var("STRANDENVTEST_CHANNEL_CAPACITY", "128");

        let config = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .from_environment("strandenvtest")
            .unwrap()
            .into_generic();

        assert_eq!(config.get_typed::<u32>("transport.tcp_backlog").unwrap(), 16);
        assert_eq!(config.get_typed::<usize>("channel.capacity").unwrap(), 128);
    }

    #[test]
    fn invalid_type_is_reported() {
        let file = yaml_file("goroutines:\n  max: lots\n");
        let config = ConfigurationLoader::default().from_yaml(file.path()).unwrap().into_generic();

        let result = config.try_get_typed::<usize>("goroutines.max");
        assert!(matches!(result, Err(ConfigurationError::InvalidFieldType { .. })));
    }

    #[test]
    fn missing_file_is_skipped_by_try_variant() {
        #[derive(Deserialize)]
        struct Empty {}

        let loader = ConfigurationLoader::default().try_from_yaml("/nonexistent/strand.yaml");
        assert!(loader.into_typed::<Empty>().is_ok());
        assert!(ConfigurationLoader::default().from_yaml("/nonexistent/strand.yaml").is_err());
    }

    #[test]
    fn serialized_values_are_overridden_by_files() {
        let file = yaml_file("supervisor:\n  max_restarts: 7\n");
        let config = ConfigurationLoader::default()
            .from_serialized(serde_json::json!({ "supervisor": { "max_restarts": 3, "time_window_secs": 5 } }))
            .from_yaml(file.path())
            .unwrap()
            .into_generic();

        assert_eq!(config.get_typed::<usize>("supervisor.max_restarts").unwrap(), 7);
        assert_eq!(config.get_typed::<u64>("supervisor.time_window_secs").unwrap(), 5);
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(matches!(
            ConfigurationLoader::default().from_environment(""),
            Err(ConfigurationError::EmptyPrefix)
        ));
    }
}
