//! Script languages accepted by `run_code`.

use serde::{Deserialize, Serialize};

/// Interpreter family for a code snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    Bash,
    Sh,
    Node,
}

impl Language {
    /// Every name accepted by `parse`, for error messages.
    pub const NAMES: &'static [&'static str] = &[
        "python",
        "python3",
        "py",
        "bash",
        "sh",
        "node",
        "javascript",
        "js",
    ];

    /// Resolve a language name or alias, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Self::Python),
            "bash" => Some(Self::Bash),
            "sh" => Some(Self::Sh),
            "node" | "javascript" | "js" => Some(Self::Node),
            _ => None,
        }
    }

    /// Interpreter executable.
    pub fn runner(&self) -> &'static str {
        match self {
            Self::Python => "python3",
            Self::Bash => "bash",
            Self::Sh => "sh",
            Self::Node => "node",
        }
    }

    /// Script file extension, including the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Python => ".py",
            Self::Bash | Self::Sh => ".sh",
            Self::Node => ".js",
        }
    }
}
