//! # Configuration Surface
//!
//! Components register typed flags on a shared [`FlagSet`]; the container
//! loads the env file and resolves everything once, before any component is
//! configured.
//!
//! Precedence, lowest first: env file < built-in default < environment
//! variable < explicit command-line flag. The env file only fills variables
//! the process environment does not already define, so a real environment
//! variable always beats the file.

pub mod env;
pub mod flags;

pub use env::{env_name, load_env_file, DEFAULT_ENV_FILE, ENV_FILE_VAR};
pub use flags::{Flag, FlagSet};
