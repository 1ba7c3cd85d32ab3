use serde::{Deserialize, Serialize};
use std::fmt;

/// The four package ecosystems an install session can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// The distribution repositories (pacman). Always privileged.
    SystemRepo,
    /// An AUR helper (yay, paru, ...). Handles its own elevation internally.
    CommunityHelper,
    /// Flatpak. Privileged only for system-wide installs.
    SandboxedApp,
    /// pip. Privileged only for system-wide installs.
    LanguageRegistry,
}

impl Source {
    // whether the broker has to prepend an elevation prefix for this source
    pub fn needs_elevation(&self, force_elevated: bool) -> bool {
        match self {
            Source::SystemRepo => true,
            Source::CommunityHelper => false,
            Source::SandboxedApp | Source::LanguageRegistry => force_elevated,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::SystemRepo => write!(f, "pacman"),
            Source::CommunityHelper => write!(f, "aur"),
            Source::SandboxedApp => write!(f, "flatpak"),
            Source::LanguageRegistry => write!(f, "pip"),
        }
    }
}

/// Identifier handed to the underlying tool. For flatpak this is the
/// application ID (org.example.App), not the display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageToken(pub String);

impl PackageToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PackageToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PackageToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Install,
    Uninstall,
    Update,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Install => write!(f, "install"),
            Action::Uninstall => write!(f, "uninstall"),
            Action::Update => write!(f, "update"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOptions {
    /// User explicitly chose "install with elevated privileges": flatpak goes
    /// system-wide and pip installs into the system prefix.
    pub force_elevated: bool,
}

/// One source and its ordered package tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSet {
    pub source: Source,
    pub tokens: Vec<PackageToken>,
}

/// Everything one orchestrator run needs. Immutable once submitted; source
/// order is preserved so elevation prompts never overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequest {
    pub action: Action,
    pub sources: Vec<SourceSet>,
    pub options: InstallOptions,
}

impl InstallRequest {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            sources: Vec::new(),
            options: InstallOptions::default(),
        }
    }

    pub fn install() -> Self {
        Self::new(Action::Install)
    }

    pub fn uninstall() -> Self {
        Self::new(Action::Uninstall)
    }

    pub fn update() -> Self {
        Self::new(Action::Update)
    }

    pub fn with_source(
        mut self,
        source: Source,
        tokens: impl IntoIterator<Item = impl Into<PackageToken>>,
    ) -> Self {
        let tokens: Vec<PackageToken> = tokens.into_iter().map(Into::into).collect();
        // an empty set would count zero packages but still fail the build
        // step, so it never enters the request
        if tokens.is_empty() {
            return self;
        }
        // merging into an existing entry keeps insertion order stable
        if let Some(set) = self.sources.iter_mut().find(|s| s.source == source) {
            set.tokens.extend(tokens);
        } else {
            self.sources.push(SourceSet { source, tokens });
        }
        self
    }

    pub fn elevated(mut self) -> Self {
        self.options.force_elevated = true;
        self
    }

    pub fn total_tokens(&self) -> usize {
        self.sources.iter().map(|s| s.tokens.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.iter().all(|s| s.tokens.is_empty())
    }
}
