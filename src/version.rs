//! Version and build information
//!
//! Values are captured by `build.rs` at compile time.

use std::fmt;

use crate::protocol::version::PROTOCOL_VERSION;

/// Build information embedded at compile time
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    /// Short git commit hash
    pub git_hash: &'static str,
    pub git_branch: &'static str,
    git_dirty_str: &'static str,
    pub build_timestamp: &'static str,
    /// Target triple (e.g., x86_64-unknown-linux-gnu)
    pub target: &'static str,
    /// Build profile (debug/release)
    pub profile: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("GOSSIP_GIT_HASH"),
            git_branch: env!("GOSSIP_GIT_BRANCH"),
            git_dirty_str: env!("GOSSIP_GIT_DIRTY"),
            build_timestamp: env!("GOSSIP_BUILD_TIMESTAMP"),
            target: env!("GOSSIP_TARGET"),
            profile: env!("GOSSIP_PROFILE"),
            rustc_version: env!("GOSSIP_RUSTC_VERSION"),
        }
    }

    /// Whether the working tree had uncommitted changes at build time
    pub fn git_dirty(&self) -> bool {
        self.git_dirty_str == "true"
    }

    /// Version with commit suffix (e.g., "0.1.0-abc12345")
    pub fn full_version(&self) -> String {
        let dirty = if self.git_dirty() { "-dirty" } else { "" };
        format!("{}-{}{}", self.version, self.git_hash, dirty)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "  Protocol:   {}", PROTOCOL_VERSION)?;
        writeln!(
            f,
            "  Git:        {} on {}{}",
            self.git_hash,
            self.git_branch,
            if self.git_dirty() { " (dirty)" } else { "" }
        )?;
        writeln!(f, "  Built:      {} ({})", self.build_timestamp, self.profile)?;
        writeln!(f, "  Target:     {}", self.target)?;
        writeln!(f, "  Compiler:   {}", self.rustc_version)?;
        Ok(())
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

/// Print the full version block to stdout
pub fn print_version() {
    print!("{}", build_info());
}
