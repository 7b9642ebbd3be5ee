//! Java runtime discovery for the Lumen launcher.
//!
//! Discovery sources are tried in this order:
//! 1. an explicit home passed by the caller (user preference),
//! 2. `JAVA_HOME`,
//! 3. `java` on `PATH` (first hit wins, symlinks resolved).
//!
//! A located executable is probed with `java -XshowSettings:properties
//! -version` to obtain `java.version` and `java.home`. "No Java installed" is
//! not an error (`Ok(None)`); a `java` binary that produces unrecognizable
//! version output is (the environment is broken in a way the caller cannot
//! paper over).

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use thiserror::Error;
use tracing::debug;

/// One located Java installation.
///
/// Immutable after construction. JDK classification and the `tools.jar`
/// lookup touch the filesystem, so both are computed on first use and cached
/// for the life of the value.
#[derive(Debug)]
pub struct JavaRuntime {
    home: PathBuf,
    executable: PathBuf,
    major_version: u32,
    is_jdk: OnceLock<bool>,
    tools_jar: OnceLock<Option<PathBuf>>,
}

impl JavaRuntime {
    pub fn new(
        home: impl Into<PathBuf>,
        executable: impl Into<PathBuf>,
        major_version: u32,
    ) -> Self {
        Self {
            home: home.into(),
            executable: executable.into(),
            major_version,
            is_jdk: OnceLock::new(),
            tools_jar: OnceLock::new(),
        }
    }

    /// Installation root, as reported by the runtime's `java.home` property.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Absolute path to the `java` binary.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Normalized major version: 8 for `1.8.0_161`, 9 for `9.0.4`, etc.
    pub fn major_version(&self) -> u32 {
        self.major_version
    }

    /// Whether this installation is a JDK rather than a plain JRE.
    ///
    /// Pre-9 runtimes are JDKs iff a `tools.jar` can be found; 9+ runtimes
    /// ship no `tools.jar`, so the `jdk.management` jmod stands in as the
    /// marker instead.
    pub fn is_jdk(&self) -> bool {
        *self.is_jdk.get_or_init(|| {
            if self.major_version >= 9 {
                self.home.join("jmods").join("jdk.management.jmod").is_file()
            } else {
                self.tools_jar().is_some()
            }
        })
    }

    /// Location of `tools.jar`, for runtimes that have one.
    ///
    /// Always `None` for major version 9 and up, regardless of what is on
    /// disk. For older runtimes both `<home>/lib/tools.jar` and
    /// `<home>/../lib/tools.jar` are probed; the latter covers `java.home`
    /// pointing at the `jre` directory nested inside a JDK.
    pub fn tools_jar(&self) -> Option<&Path> {
        self.tools_jar
            .get_or_init(|| {
                if self.major_version >= 9 {
                    return None;
                }

                let direct = self.home.join("lib").join("tools.jar");
                if direct.is_file() {
                    return Some(direct);
                }

                let parent = self.home.parent()?.join("lib").join("tools.jar");
                parent.is_file().then_some(parent)
            })
            .as_deref()
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(
        "`{executable} -XshowSettings:properties -version` did not report \
         java.version/java.home properties"
    )]
    UnrecognizedVersionOutput { executable: PathBuf },

    #[error("failed to run `{executable}`: {source}")]
    Exec {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Locate the best available Java runtime.
///
/// When `explicit_home` is set it is used as-is (after symlink resolution)
/// and environment lookup is skipped, falling back to the `PATH` scan only if
/// no `bin/java` exists under it. Returns `Ok(None)` when no runtime can be
/// found at all.
pub fn resolve(explicit_home: Option<&Path>) -> Result<Option<JavaRuntime>, ResolveError> {
    let Some(executable) = find_java_executable(explicit_home) else {
        return Ok(None);
    };
    debug!(executable = %executable.display(), "probing java runtime");

    let props = query_runtime_properties(&executable)?;
    let Some(major_version) = parse_major_version(&props.version) else {
        return Err(ResolveError::UnrecognizedVersionOutput { executable });
    };

    Ok(Some(JavaRuntime::new(props.home, executable, major_version)))
}

/// Like [`resolve`], but upgrades a JRE to a side-by-side JDK install when
/// one exists.
///
/// Windows installers commonly lay out `jre1.8.0_161` and `jdk1.8.0_161` as
/// siblings rather than nesting the JRE inside the JDK. The sibling is
/// assumed to be version-matched, so its version is not re-queried. Purely
/// best-effort: when no sibling is found the original (possibly non-JDK)
/// runtime is returned unchanged.
pub fn resolve_preferring_jdk(
    explicit_home: Option<&Path>,
) -> Result<Option<JavaRuntime>, ResolveError> {
    Ok(resolve(explicit_home)?.map(prefer_jdk))
}

/// The sibling-upgrade step of [`resolve_preferring_jdk`], split out so the
/// lookup can run against an already-resolved runtime.
pub fn prefer_jdk(runtime: JavaRuntime) -> JavaRuntime {
    if runtime.is_jdk() {
        return runtime;
    }

    debug!(home = %runtime.home().display(), "resolved runtime is not a JDK, looking for a sibling");
    sibling_jdk(&runtime).unwrap_or(runtime)
}

fn sibling_jdk(runtime: &JavaRuntime) -> Option<JavaRuntime> {
    let home = runtime.home();
    let base = home.file_name()?.to_str()?;
    let alt = base.replace("jre", "jdk");
    if alt == base {
        return None;
    }

    let alt_home = home.parent()?.join(&alt);
    if !alt_home.is_dir() {
        return None;
    }

    let executable = alt_home.join("bin").join(java_binary_name());
    debug!(home = %alt_home.display(), "found sibling JDK");
    Some(JavaRuntime::new(
        alt_home,
        executable,
        runtime.major_version(),
    ))
}

fn find_java_executable(explicit_home: Option<&Path>) -> Option<PathBuf> {
    let home = explicit_home
        .map(Path::to_path_buf)
        .or_else(|| env::var_os("JAVA_HOME").map(PathBuf::from));

    if let Some(home) = home {
        // Resolve symlinks so the home reported to callers is the real
        // install root, not e.g. /usr/lib/jvm/default.
        let home = home.canonicalize().unwrap_or(home);
        let candidate = home.join("bin").join(java_binary_name());
        if candidate.is_file() {
            return Some(candidate);
        }
        // Stale JAVA_HOME is common enough to not be fatal.
        debug!(home = %home.display(), "java home has no bin/java, falling back to PATH");
    }

    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(java_binary_name());
        if candidate.is_file() {
            return Some(candidate.canonicalize().unwrap_or(candidate));
        }
    }

    None
}

struct RuntimeProperties {
    version: String,
    home: PathBuf,
}

fn query_runtime_properties(executable: &Path) -> Result<RuntimeProperties, ResolveError> {
    let output = Command::new(executable)
        .args(["-XshowSettings:properties", "-version"])
        .output()
        .map_err(|source| ResolveError::Exec {
            executable: executable.to_path_buf(),
            source,
        })?;

    // HotSpot prints settings to stderr, but we accept both streams.
    let mut combined = String::from_utf8_lossy(&output.stderr).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stdout));

    let mut version = None;
    let mut home = None;
    for line in combined.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "java.version" => version = Some(value.trim().to_string()),
            "java.home" => home = Some(PathBuf::from(value.trim())),
            _ => {}
        }
    }

    match (version, home) {
        (Some(version), Some(home)) => Ok(RuntimeProperties { version, home }),
        _ => Err(ResolveError::UnrecognizedVersionOutput {
            executable: executable.to_path_buf(),
        }),
    }
}

/// Normalize a `java.version` string to its major version.
///
/// Legacy `1.x` versions take the second dot-component (`1.8.0_161` is Java
/// 8); every newer scheme takes the first (`9.0.4`, `17.0.2`).
pub fn parse_major_version(version: &str) -> Option<u32> {
    let mut pieces = version.split('.');
    let first: u32 = pieces.next()?.trim().parse().ok()?;
    if first == 1 {
        pieces.next()?.trim().parse().ok()
    } else {
        Some(first)
    }
}

fn java_binary_name() -> &'static str {
    if cfg!(windows) {
        "java.exe"
    } else {
        "java"
    }
}
