use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One fully expanded command line; `argv[0]` is the executable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ConcreteCommand(pub Vec<String>);

impl ConcreteCommand {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(args.into_iter().map(Into::into).collect())
    }

    pub fn program(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.0.get(1..).unwrap_or(&[])
    }

    /// Space-joined rendering used as the result key.
    pub fn render(&self) -> String {
        self.0.join(" ")
    }
}

/// Captured outcome of one finished process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub returncode: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ExecutionResult {
    /// Build a result from raw process output, splitting each stream on `\n`.
    ///
    /// A trailing newline yields a trailing empty line, so `"a\n"` becomes `["a", ""]`.
    pub fn from_output(returncode: i32, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            returncode,
            stdout: split_lines(stdout),
            stderr: split_lines(stderr),
        }
    }

    pub fn failure(returncode: i32, message: impl Into<String>) -> Self {
        Self {
            returncode,
            stdout: vec![String::new()],
            stderr: vec![message.into()],
        }
    }
}

fn split_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .split('\n')
        .map(str::to_string)
        .collect()
}

/// Results keyed by rendered command line, in completion order.
///
/// Recording the same rendered command twice keeps the first position and the latest result.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct ResultSet(IndexMap<String, ExecutionResult>);

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, result: ExecutionResult) {
        self.0.insert(key, result);
    }

    pub fn get(&self, key: &str) -> Option<&ExecutionResult> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExecutionResult)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}
