//! Language-server process launch.
//!
//! The launch protocol is connect-back: a loopback `TcpListener` is bound
//! *before* the Java process is spawned, the chosen port is handed to the
//! child via `-Dserver.port`, and the child connects to us. Binding first
//! removes the race where the child dials a listener that does not exist yet.
//!
//! The port is picked at random from the ephemeral range so several sessions
//! (multi-window, multi-workspace) can coexist on one machine; a bind
//! conflict just retries with a fresh port.

use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use lumen_jvm::JavaRuntime;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::debug;

/// Minimum supported Java major version.
pub const MIN_MAJOR_VERSION: u32 = 8;

/// Port used by [`attach`] when none is given. Matches the fixed debug port
/// language-server developers start their server on from an IDE.
pub const DEFAULT_ATTACH_PORT: u16 = 5007;

/// JDWP agent argument injected by [`LaunchSpec::debug`]; suspends the JVM
/// until a debugger attaches on port 8000.
pub const DEBUG_AGENT_ARG: &str =
    "-agentlib:jdwp=transport=dt_socket,server=y,address=8000,suspend=y";

const PORT_RANGE: std::ops::Range<u16> = 40_000..50_000;
const PORT_ATTEMPTS: usize = 10;
const ACCEPT_DEADLINE: Duration = Duration::from_secs(30);

/// What to hand the JVM as the launchable artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchTarget {
    /// `java -jar <path>` (an executable fat jar).
    Jar(PathBuf),
    /// `java -cp <classpath> <main_class>` (an exploded server).
    MainClass {
        main_class: String,
        classpath: Vec<PathBuf>,
    },
}

/// Everything needed to start one language-server process.
///
/// Built by the host-editor layer, consumed by [`launch`]; not retained after
/// the process starts.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub target: LaunchTarget,
    /// Value for the `-Dsts.lsp.client` marker, e.g. `"vscode"`.
    pub client_id: String,
    /// User-supplied JVM arguments, passed through verbatim.
    pub vm_args: Vec<String>,
    /// Extra `-D` system properties (log file redirection and the like).
    pub properties: Vec<(String, String)>,
    /// Default max heap (`-Xmx`), skipped when `vm_args` already sets one.
    pub heap: Option<String>,
    /// Prepend [`DEBUG_AGENT_ARG`] so the server JVM waits for a debugger.
    pub debug: bool,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn jar(path: impl Into<PathBuf>, client_id: impl Into<String>) -> Self {
        Self::new(LaunchTarget::Jar(path.into()), client_id)
    }

    pub fn main_class(
        main_class: impl Into<String>,
        classpath: Vec<PathBuf>,
        client_id: impl Into<String>,
    ) -> Self {
        Self::new(
            LaunchTarget::MainClass {
                main_class: main_class.into(),
                classpath,
            },
            client_id,
        )
    }

    fn new(target: LaunchTarget, client_id: impl Into<String>) -> Self {
        Self {
            target,
            client_id: client_id.into(),
            vm_args: Vec::new(),
            properties: Vec::new(),
            heap: None,
            debug: false,
            cwd: None,
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(
        "Java-based language servers require Java 8 or higher \
         (found {major_version} at `{executable}`)"
    )]
    UnsupportedRuntime {
        major_version: u32,
        executable: PathBuf,
    },

    #[error("no free loopback port found after {attempts} attempts")]
    NoFreePort { attempts: usize },

    #[error("language-server artifact `{path}` does not exist")]
    MissingArtifact { path: PathBuf },

    #[error("no *language-server*.jar found in `{dir}`")]
    ServerJarNotFound { dir: PathBuf },

    #[error("multiple *language-server*.jar candidates in `{dir}`")]
    AmbiguousServerJar { dir: PathBuf },

    #[error("failed to spawn `{executable}`: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("language server exited with {status} before connecting back")]
    ExitedBeforeConnect { status: ExitStatus },

    #[error("language server did not connect within {deadline:?}")]
    AcceptTimeout { deadline: Duration },

    #[error("failed to connect to language server on debug port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Handle on the server-side process of a session.
#[derive(Debug)]
pub enum ServerProcess {
    Spawned(Child),
    /// Connect-only sessions ([`attach`]); the real process belongs to
    /// whoever started it, typically a developer's IDE debugger.
    External,
}

impl ServerProcess {
    /// Terminate the child. A no-op for [`ServerProcess::External`].
    pub async fn kill(&mut self) -> io::Result<()> {
        match self {
            Self::Spawned(child) => child.kill().await,
            Self::External => Ok(()),
        }
    }

    /// Wait for the child to exit. Pends forever for external processes,
    /// whose lifetime we cannot observe.
    pub async fn wait(&mut self) -> io::Result<Option<ExitStatus>> {
        match self {
            Self::Spawned(child) => child.wait().await.map(Some),
            Self::External => std::future::pending().await,
        }
    }

    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Spawned(child) => child.id(),
            Self::External => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Self::External)
    }
}

/// A started (or attached) language server: the process handle plus the
/// accepted socket. Both are owned exclusively and released together when the
/// session winds down.
#[derive(Debug)]
pub struct LaunchedServer {
    process: ServerProcess,
    stream: TcpStream,
}

impl LaunchedServer {
    pub fn from_parts(process: ServerProcess, stream: TcpStream) -> Self {
        Self { process, stream }
    }

    pub fn process(&self) -> &ServerProcess {
        &self.process
    }

    pub fn into_parts(self) -> (ServerProcess, TcpStream) {
        (self.process, self.stream)
    }
}

/// Start the language-server process described by `spec` and wait for it to
/// connect back.
///
/// The runtime version gate runs before anything else: no port is bound and
/// no process is spawned for a pre-8 JVM.
pub async fn launch(
    runtime: &JavaRuntime,
    spec: LaunchSpec,
) -> Result<LaunchedServer, LaunchError> {
    if runtime.major_version() < MIN_MAJOR_VERSION {
        return Err(LaunchError::UnsupportedRuntime {
            major_version: runtime.major_version(),
            executable: runtime.executable().to_path_buf(),
        });
    }

    if let LaunchTarget::Jar(jar) = &spec.target {
        // The artifact download step runs before us; by launch time the jar
        // either exists or the install failed.
        if !jar.is_file() {
            return Err(LaunchError::MissingArtifact { path: jar.clone() });
        }
    }

    let candidates = std::iter::repeat_with(|| rand::random_range(PORT_RANGE)).take(PORT_ATTEMPTS);
    let listener = bind_first_free(candidates).await?;
    let port = listener.local_addr()?.port();

    let args = build_args(runtime, &spec, port);
    debug!(
        port,
        "starting `{} {}`",
        runtime.executable().display(),
        args.join(" ")
    );

    let mut command = Command::new(runtime.executable());
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    command.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        executable: runtime.executable().to_path_buf(),
        source,
    })?;
    forward_server_output(&mut child);

    // Exactly one inbound connection is expected; racing the accept against
    // child exit keeps a crashed server from hanging the launch.
    let stream = tokio::select! {
        accepted = listener.accept() => {
            let (stream, peer) = accepted?;
            debug!(%peer, "language server connected");
            stream
        }
        status = child.wait() => {
            return Err(LaunchError::ExitedBeforeConnect { status: status? });
        }
        _ = tokio::time::sleep(ACCEPT_DEADLINE) => {
            let _ = child.start_kill();
            return Err(LaunchError::AcceptTimeout { deadline: ACCEPT_DEADLINE });
        }
    };
    drop(listener);

    Ok(LaunchedServer {
        process: ServerProcess::Spawned(child),
        stream,
    })
}

/// Connect to an already-running language server instead of spawning one.
///
/// Debug mode for language-server developers: the server runs under their
/// IDE on a fixed port and must outlive the session, so the returned handle
/// is [`ServerProcess::External`].
pub async fn attach(port: Option<u16>) -> Result<LaunchedServer, LaunchError> {
    let port = port.unwrap_or(DEFAULT_ATTACH_PORT);
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
        .await
        .map_err(|source| LaunchError::Connect { port, source })?;
    debug!(port, "attached to externally managed language server");

    Ok(LaunchedServer {
        process: ServerProcess::External,
        stream,
    })
}

/// Locate the single `*language-server*.jar` inside `dir`.
///
/// Zero or several candidates are both errors: the caller bundles (or
/// downloads) exactly one server build, anything else means a broken install.
pub fn find_server_jar(dir: &Path) -> Result<PathBuf, LaunchError> {
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.contains("language-server") && name.ends_with(".jar") {
            matches.push(entry.path());
        }
    }

    matches.sort();
    let mut matches = matches.into_iter();
    match (matches.next(), matches.next()) {
        (Some(jar), None) => Ok(jar),
        (None, _) => Err(LaunchError::ServerJarNotFound {
            dir: dir.to_path_buf(),
        }),
        (Some(_), Some(_)) => Err(LaunchError::AmbiguousServerJar {
            dir: dir.to_path_buf(),
        }),
    }
}

async fn bind_first_free(
    candidates: impl Iterator<Item = u16>,
) -> Result<TcpListener, LaunchError> {
    let mut attempts = 0;
    for port in candidates {
        attempts += 1;
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                debug!(port, "loopback port already taken, retrying");
            }
            Err(err) => return Err(LaunchError::Io(err)),
        }
    }
    Err(LaunchError::NoFreePort { attempts })
}

fn build_args(runtime: &JavaRuntime, spec: &LaunchSpec, port: u16) -> Vec<String> {
    let mut args = Vec::new();

    // In jar mode the boot-loader picks tools.jar up via loader.path; in
    // main-class mode it goes on the classpath below.
    if let (LaunchTarget::Jar(_), Some(tools_jar)) = (&spec.target, runtime.tools_jar()) {
        args.push(format!("-Dloader.path={}", tools_jar.display()));
    }
    if spec.debug {
        args.push(DEBUG_AGENT_ARG.to_string());
    }
    if let Some(heap) = &spec.heap {
        if !spec.vm_args.iter().any(|arg| arg.starts_with("-Xmx")) {
            args.push(format!("-Xmx{heap}"));
        }
    }
    args.extend(spec.vm_args.iter().cloned());
    for (key, value) in &spec.properties {
        args.push(format!("-D{key}={value}"));
    }
    args.push(format!("-Dserver.port={port}"));
    args.push(format!("-Dsts.lsp.client={}", spec.client_id));

    match &spec.target {
        LaunchTarget::Jar(jar) => {
            args.push("-jar".to_string());
            args.push(jar.display().to_string());
        }
        LaunchTarget::MainClass {
            main_class,
            classpath,
        } => {
            let mut classpath = classpath.clone();
            if let Some(tools_jar) = runtime.tools_jar() {
                classpath.insert(0, tools_jar.to_path_buf());
            }
            args.push("-cp".to_string());
            args.push(join_classpath(&classpath));
            args.push(main_class.clone());
        }
    }

    args
}

fn join_classpath(entries: &[PathBuf]) -> String {
    let sep = if cfg!(windows) { ";" } else { ":" };
    entries
        .iter()
        .map(|entry| entry.display().to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

fn forward_server_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "lumen_launch::server", "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "lumen_launch::server", "{line}");
            }
        });
    }
}
