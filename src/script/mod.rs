//! CGI-style bridge to an external script interpreter.
//!
//! Every request routed to a script gets a freshly synthesized environment
//! (`$_SERVER`, `$_GET`, `$_POST`, `$_COOKIE`) that is written as a PHP
//! prelude into its own work file and executed by the interpreter binary.

pub mod bridge;
pub mod environment;

pub use bridge::{execute, InterpreterRunner, ScriptOutput, ScriptRunner};
pub use environment::ScriptEnvironment;
