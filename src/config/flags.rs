//! Typed flag registry resolved through `figment`.
//!
//! Components declare their settings once, in `init_flags`, and keep the
//! returned [`Flag`] handle. After [`FlagSet::parse`] every handle yields the
//! resolved value; before that it yields its default.

use super::env::env_name;
use crate::error::ConfigError;
use figment::providers::Serialized;
use figment::value::{Dict, Map, Value};
use figment::{Figment, Metadata, Profile, Provider};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};
use tracing::debug;

type Validator = Box<dyn Fn(&Figment) -> Result<(), figment::Error> + Send + Sync>;
type DefaultLayer = Box<dyn Fn(Figment) -> Figment + Send + Sync>;

/// How raw text from the environment or the command line becomes a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagKind {
    Bool,
    Text,
    Parsed,
}

impl FlagKind {
    fn value(self, raw: &str) -> Value {
        match self {
            FlagKind::Text => Value::from(raw.to_string()),
            FlagKind::Bool | FlagKind::Parsed => raw
                .parse::<Value>()
                .unwrap_or_else(|never| match never {}),
        }
    }
}

struct FlagSpec {
    name: String,
    usage: String,
    kind: FlagKind,
    default_text: String,
    is_zero: bool,
    default_layer: DefaultLayer,
    validate: Validator,
}

/// A registered flag. Cheap to clone; every clone sees the parsed value.
#[derive(Clone)]
pub struct Flag<T> {
    key: String,
    default: T,
    resolved: Arc<RwLock<Option<Figment>>>,
}

impl<T> Flag<T>
where
    T: DeserializeOwned + Clone,
{
    pub fn name(&self) -> &str {
        &self.key
    }

    /// Current value: environment and command line applied over the default.
    pub fn get(&self) -> T {
        let Ok(guard) = self.resolved.read() else {
            return self.default.clone();
        };
        guard
            .as_ref()
            .and_then(|figment| figment.extract_inner::<T>(&self.key).ok())
            .unwrap_or_else(|| self.default.clone())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Flag<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flag")
            .field("name", &self.key)
            .field("default", &self.default)
            .finish()
    }
}

/// The process configuration surface: every flag of every component.
pub struct FlagSet {
    app_name: String,
    env_prefix: String,
    flags: BTreeMap<String, FlagSpec>,
    duplicates: Vec<String>,
    rest: Vec<String>,
    resolved: Arc<RwLock<Option<Figment>>>,
}

impl FlagSet {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            env_prefix: String::new(),
            flags: BTreeMap::new(),
            duplicates: Vec::new(),
            rest: Vec::new(),
            resolved: Arc::new(RwLock::new(None)),
        }
    }

    /// Prefix prepended to every environment variable name.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn set_app_name(&mut self, app_name: impl Into<String>) {
        self.app_name = app_name.into();
    }

    /// Registers a flag and returns its handle.
    ///
    /// Registering the same name twice is reported by [`FlagSet::parse`].
    pub fn register<T>(&mut self, name: &str, default: T, usage: &str) -> Flag<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let key = flag_key(name);
        let (kind, default_text, is_zero) = describe(&default);

        if self.flags.contains_key(&key) {
            self.duplicates.push(name.to_string());
        } else {
            let layer_key = key.clone();
            let layer_default = default.clone();
            let check_key = key.clone();
            self.flags.insert(
                key.clone(),
                FlagSpec {
                    name: name.to_string(),
                    usage: usage.to_string(),
                    kind,
                    default_text,
                    is_zero,
                    default_layer: Box::new(move |figment| {
                        figment.merge(Serialized::default(&layer_key, layer_default.clone()))
                    }),
                    validate: Box::new(move |figment| {
                        figment.extract_inner::<T>(&check_key).map(|_| ())
                    }),
                },
            );
        }

        Flag {
            key,
            default,
            resolved: self.resolved.clone(),
        }
    }

    pub fn bool(&mut self, name: &str, default: bool, usage: &str) -> Flag<bool> {
        self.register(name, default, usage)
    }

    pub fn string(&mut self, name: &str, default: &str, usage: &str) -> Flag<String> {
        self.register(name, default.to_string(), usage)
    }

    pub fn u16(&mut self, name: &str, default: u16, usage: &str) -> Flag<u16> {
        self.register(name, default, usage)
    }

    pub fn u64(&mut self, name: &str, default: u64, usage: &str) -> Flag<u64> {
        self.register(name, default, usage)
    }

    pub fn usize(&mut self, name: &str, default: usize, usage: &str) -> Flag<usize> {
        self.register(name, default, usage)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flags.contains_key(&flag_key(name))
    }

    /// Positional arguments left after the last flag.
    pub fn args(&self) -> &[String] {
        &self.rest
    }

    /// Resolves every flag: defaults, then environment, then `args`.
    pub fn parse<I, S>(&mut self, args: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(name) = self.duplicates.first() {
            return Err(ConfigError::DuplicateFlag(name.clone()));
        }

        let (cli, rest) = self.parse_args(args.into_iter().map(Into::into))?;

        let mut figment = Figment::new();
        for spec in self.flags.values() {
            figment = (spec.default_layer)(figment);
        }
        let figment = figment
            .merge(EnvFlags {
                flags: &self.flags,
                prefix: &self.env_prefix,
            })
            .merge(CommandLine(cli));

        for spec in self.flags.values() {
            (spec.validate)(&figment).map_err(|source| ConfigError::InvalidValue {
                name: spec.name.clone(),
                source: Box::new(source),
            })?;
        }

        debug!(flags = self.flags.len(), "flags parsed");
        self.rest = rest;
        if let Ok(mut slot) = self.resolved.write() {
            *slot = Some(figment);
        }
        Ok(())
    }

    fn parse_args<I>(&self, args: I) -> Result<(Dict, Vec<String>), ConfigError>
    where
        I: Iterator<Item = String>,
    {
        let mut args = args;
        let mut values = Dict::new();
        let mut rest = Vec::new();

        while let Some(arg) = args.next() {
            if arg == "--" {
                rest.extend(args.by_ref());
                break;
            }
            if arg.len() < 2 || !arg.starts_with('-') {
                rest.push(arg);
                rest.extend(args.by_ref());
                break;
            }

            let stripped = arg.strip_prefix("--").unwrap_or(&arg[1..]);
            let (name, inline) = match stripped.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (stripped, None),
            };
            let key = flag_key(name);
            if matches!(name, "h" | "help") && !self.flags.contains_key(&key) {
                return Err(ConfigError::Help(self.usage()));
            }
            let spec = self
                .flags
                .get(&key)
                .ok_or_else(|| ConfigError::UnknownFlag(name.to_string()))?;

            let raw = match (inline, spec.kind) {
                (Some(value), _) => value,
                (None, FlagKind::Bool) => "true".to_string(),
                (None, _) => args
                    .next()
                    .ok_or_else(|| ConfigError::MissingValue(name.to_string()))?,
            };
            values.insert(key, spec.kind.value(&raw));
        }

        Ok((values, rest))
    }

    /// A commented `.env` template listing every flag.
    pub fn sample_env(&self) -> String {
        let mut out = String::new();
        for spec in self.flags.values() {
            let _ = writeln!(out, "## {} (-{})", spec.usage, spec.name);
            let _ = write!(out, "#{}=", env_name(&spec.name, &self.env_prefix));
            if !spec.is_zero {
                out.push_str(&quoted_default(spec));
            }
            out.push_str("\n\n");
        }
        out
    }

    /// Help text listing every flag with its default and env name. Returned
    /// as [`ConfigError::Help`] when `-h` or `--help` is parsed.
    pub fn usage(&self) -> String {
        let mut out = format!("Usage of {}:\n", self.app_name);
        for spec in self.flags.values() {
            let _ = write!(out, "  -{}\n    \t{}", spec.name, spec.usage);
            if !spec.is_zero {
                let _ = write!(out, " (default {})", quoted_default(spec));
            }
            let _ = writeln!(out, " [${}]", env_name(&spec.name, &self.env_prefix));
        }
        out
    }
}

impl std::fmt::Debug for FlagSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagSet")
            .field("app_name", &self.app_name)
            .field("flags", &self.flags.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Figment nests on `.`, so dotted names are stored flat.
fn flag_key(name: &str) -> String {
    name.replace('.', "-")
}

fn describe<T: Serialize>(default: &T) -> (FlagKind, String, bool) {
    match serde_json::to_value(default) {
        Ok(serde_json::Value::Bool(b)) => (FlagKind::Bool, b.to_string(), !b),
        Ok(serde_json::Value::String(s)) => {
            let zero = s.is_empty();
            (FlagKind::Text, s, zero)
        }
        Ok(serde_json::Value::Number(n)) => {
            let zero = n.as_f64() == Some(0.0);
            (FlagKind::Parsed, n.to_string(), zero)
        }
        Ok(serde_json::Value::Null) | Err(_) => (FlagKind::Parsed, String::new(), true),
        Ok(other) => (FlagKind::Parsed, other.to_string(), false),
    }
}

fn quoted_default(spec: &FlagSpec) -> String {
    match spec.kind {
        FlagKind::Text => format!("{:?}", spec.default_text),
        _ => spec.default_text.clone(),
    }
}

struct EnvFlags<'a> {
    flags: &'a BTreeMap<String, FlagSpec>,
    prefix: &'a str,
}

impl Provider for EnvFlags<'_> {
    fn metadata(&self) -> Metadata {
        Metadata::named("environment variable")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        let mut dict = Dict::new();
        for (key, spec) in self.flags {
            if let Ok(raw) = std::env::var(env_name(&spec.name, self.prefix)) {
                dict.insert(key.clone(), spec.kind.value(&raw));
            }
        }
        Ok(Profile::Default.collect(dict))
    }
}

struct CommandLine(Dict);

impl Provider for CommandLine {
    fn metadata(&self) -> Metadata {
        Metadata::named("command-line flag")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Ok(Profile::Default.collect(self.0.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_before_and_after_parse() {
        let mut flags = FlagSet::new("test");
        let port = flags.u16("flags-test-port", 3000, "port");
        assert_eq!(port.get(), 3000);

        flags.parse(Vec::<String>::new()).unwrap();
        assert_eq!(port.get(), 3000);
    }

    #[test]
    fn command_line_forms() {
        let mut flags = FlagSet::new("test");
        let port = flags.u16("flags-cli-port", 3000, "port");
        let name = flags.string("flags-cli-name", "", "name");
        let verbose = flags.bool("flags-cli-verbose", false, "verbose");
        let level = flags.string("flags-cli-level", "info", "level");

        flags
            .parse([
                "--flags-cli-port=8080",
                "-flags-cli-name",
                "demo",
                "--flags-cli-verbose",
                "--flags-cli-level",
                "debug",
                "serve",
                "--not-a-flag",
            ])
            .unwrap();

        assert_eq!(port.get(), 8080);
        assert_eq!(name.get(), "demo");
        assert!(verbose.get());
        assert_eq!(level.get(), "debug");
        assert_eq!(flags.args(), ["serve", "--not-a-flag"]);
    }

    #[test]
    fn numeric_text_stays_a_string() {
        let mut flags = FlagSet::new("test");
        let name = flags.string("flags-text-name", "", "name");
        flags.parse(["--flags-text-name=1234"]).unwrap();
        assert_eq!(name.get(), "1234");
    }

    #[test]
    fn environment_overrides_default_and_cli_overrides_environment() {
        std::env::set_var("FLAGS_ENV_WORKERS", "8");
        std::env::set_var("FLAGS_ENV_MODE", "fast");

        let mut flags = FlagSet::new("test");
        let workers = flags.usize("flags-env-workers", 1, "workers");
        let mode = flags.string("flags-env-mode", "slow", "mode");
        flags.parse(["--flags-env-mode=cli"]).unwrap();

        assert_eq!(workers.get(), 8);
        assert_eq!(mode.get(), "cli");

        std::env::remove_var("FLAGS_ENV_WORKERS");
        std::env::remove_var("FLAGS_ENV_MODE");
    }

    #[test]
    fn env_prefix_applies() {
        std::env::set_var("SKT_FLAGS_PREFIXED", "true");
        let mut flags = FlagSet::new("test").with_env_prefix("skt_");
        let on = flags.bool("flags-prefixed", false, "toggle");
        flags.parse(Vec::<String>::new()).unwrap();
        assert!(on.get());
        std::env::remove_var("SKT_FLAGS_PREFIXED");
    }

    #[test]
    fn rejects_unknown_missing_and_invalid() {
        let mut flags = FlagSet::new("test");
        flags.u16("flags-bad-port", 1, "port");

        assert!(matches!(
            flags.parse(["--nope"]),
            Err(ConfigError::UnknownFlag(name)) if name == "nope"
        ));
        assert!(matches!(
            flags.parse(["--flags-bad-port"]),
            Err(ConfigError::MissingValue(_))
        ));
        assert!(matches!(
            flags.parse(["--flags-bad-port=abc"]),
            Err(ConfigError::InvalidValue { name, .. }) if name == "flags-bad-port"
        ));
    }

    #[test]
    fn help_flag_returns_usage() {
        let mut flags = FlagSet::new("helpful");
        flags.u16("flags-help-port", 8080, "Port to listen on");

        for arg in ["-h", "--help", "-help"] {
            match flags.parse([arg]) {
                Err(ConfigError::Help(usage)) => {
                    assert!(usage.starts_with("Usage of helpful:"));
                    assert!(usage.contains("-flags-help-port"));
                    assert!(usage.contains("[$FLAGS_HELP_PORT]"));
                }
                other => panic!("unexpected result for {arg}: {other:?}"),
            }
        }
    }

    #[test]
    fn duplicate_registration_is_reported() {
        let mut flags = FlagSet::new("test");
        flags.bool("flags-dup", false, "a");
        flags.bool("flags-dup", true, "b");
        assert!(matches!(
            flags.parse(Vec::<String>::new()),
            Err(ConfigError::DuplicateFlag(name)) if name == "flags-dup"
        ));
    }

    #[test]
    fn sample_env_and_usage() {
        let mut flags = FlagSet::new("demo");
        flags.string("app-env", "dev", "Env for service");
        flags.bool("log-json", false, "JSON logs");

        let sample = flags.sample_env();
        assert!(sample.contains("## Env for service (-app-env)\n#APP_ENV=\"dev\"\n"));
        assert!(sample.contains("#LOG_JSON=\n"));

        let usage = flags.usage();
        assert!(usage.starts_with("Usage of demo:\n"));
        assert!(usage.contains("(default \"dev\") [$APP_ENV]"));
    }
}
