use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lumen_client::{ClientHooks, Session, SessionConfig};
use lumen_jvm::JavaRuntime;
use lumen_launch::{LaunchError, LaunchSpec, LaunchTarget};
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Launch a Java language server and drive an LSP session against it.
///
/// Intended for smoke-testing server builds without an editor in the loop:
/// resolves a JVM, starts the server (or attaches to one started from an
/// IDE), completes the handshake, and logs protocol traffic until Ctrl-C.
#[derive(Debug, Parser)]
#[command(name = "lumen", version, about)]
struct Cli {
    /// Executable language-server jar to launch.
    #[arg(long, conflicts_with_all = ["main_class", "attach"])]
    jar: Option<PathBuf>,

    /// Launch an exploded server by main class instead of a jar.
    #[arg(long, requires = "classpath")]
    main_class: Option<String>,

    /// Classpath entries for --main-class.
    #[arg(long, value_delimiter = ',')]
    classpath: Vec<PathBuf>,

    /// Connect to an already-running server instead of launching one.
    /// Defaults to the conventional debug port when no port is given.
    #[arg(long, value_name = "PORT", num_args = 0..=1)]
    attach: Option<Option<u16>>,

    /// Explicit Java home; JAVA_HOME and PATH are searched otherwise.
    #[arg(long)]
    java_home: Option<PathBuf>,

    /// Upgrade to a sibling JDK install when the resolved runtime is a JRE.
    #[arg(long)]
    prefer_jdk: bool,

    /// Client identifier passed to the server via -Dsts.lsp.client.
    #[arg(long, default_value = "cli")]
    client_id: String,

    /// Default JVM max heap, e.g. "1024m". Skipped when --vm-arg sets -Xmx.
    #[arg(long)]
    heap: Option<String>,

    /// Extra JVM arguments, repeatable.
    #[arg(long = "vm-arg", value_name = "ARG")]
    vm_args: Vec<String>,

    /// Extra -D system properties as KEY=VALUE, repeatable.
    #[arg(short = 'D', value_name = "KEY=VALUE")]
    properties: Vec<String>,

    /// Make the server JVM wait for a debugger before starting.
    #[arg(long)]
    debug_agent: bool,

    /// Working directory for the server process.
    #[arg(long, value_name = "DIR")]
    workspace: Option<PathBuf>,

    /// JSON file with flat dot-qualified settings to push after initialize.
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!("{err:#}");
            std::process::exit(exit_code(&err));
        }
    }
}

// 2 = environment problem (no/old Java), 3 = launch failure, 1 = the rest.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<LaunchError>() {
        Some(LaunchError::UnsupportedRuntime { .. }) => 2,
        Some(_) => 3,
        None if err.downcast_ref::<lumen_jvm::ResolveError>().is_some() => 2,
        None => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let server = if let Some(port) = cli.attach {
        info!(port = port.unwrap_or(lumen_launch::DEFAULT_ATTACH_PORT), "attaching");
        lumen_launch::attach(port).await?
    } else {
        let runtime = resolve_runtime(&cli)?;
        info!(
            executable = %runtime.executable().display(),
            version = runtime.major_version(),
            jdk = runtime.is_jdk(),
            "resolved java runtime"
        );
        lumen_launch::launch(&runtime, build_spec(&cli)?).await?
    };

    let disconnected = Arc::new(Notify::new());
    let hooks = ClientHooks {
        move_cursor: Box::new(|params| {
            info!(uri = params.uri.as_str(), line = params.position.line, "server asked to move the cursor");
            // No editor here to apply it in.
            lumen_client::ext::MoveCursorResponse { applied: false }
        }),
        progress: Box::new(|event| match &event.status {
            Some(status) => info!(id = event.id, "{status}"),
            None => debug!(id = event.id, "progress cleared"),
        }),
        highlight: Box::new(|params| {
            debug!(
                uri = params.doc.uri.as_str(),
                version = params.doc.version,
                lenses = params.code_lenses.len(),
                "highlight update"
            );
        }),
        classpath_listeners_changed: Box::new(|listeners| {
            debug!(?listeners, "classpath listener registry changed");
        }),
        disconnected: Box::new({
            let disconnected = Arc::clone(&disconnected);
            move || disconnected.notify_one()
        }),
    };

    let config = SessionConfig {
        initialize_params: json!({
            "processId": std::process::id(),
            "rootUri": null,
            "capabilities": { "workspace": { "executeCommand": {} } },
        }),
        initial_settings: load_settings(&cli)?,
    };

    let session = Session::start(server, hooks, config)
        .await
        .context("language server handshake failed")?;
    info!("session ready; Ctrl-C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting the session down");
            session.shutdown().await;
        }
        _ = disconnected.notified() => {
            info!("server went away");
        }
    }

    Ok(())
}

fn resolve_runtime(cli: &Cli) -> anyhow::Result<JavaRuntime> {
    let resolved = if cli.prefer_jdk {
        lumen_jvm::resolve_preferring_jdk(cli.java_home.as_deref())?
    } else {
        lumen_jvm::resolve(cli.java_home.as_deref())?
    };
    resolved.context("couldn't locate java in JAVA_HOME or PATH")
}

fn build_spec(cli: &Cli) -> anyhow::Result<LaunchSpec> {
    let target = match (&cli.jar, &cli.main_class) {
        (Some(jar), _) => LaunchTarget::Jar(jar.clone()),
        (None, Some(main_class)) => LaunchTarget::MainClass {
            main_class: main_class.clone(),
            classpath: cli.classpath.clone(),
        },
        (None, None) => anyhow::bail!("one of --jar, --main-class or --attach is required"),
    };

    let mut properties = Vec::new();
    for property in &cli.properties {
        let (key, value) = property
            .split_once('=')
            .with_context(|| format!("malformed -D property `{property}`, expected KEY=VALUE"))?;
        properties.push((key.to_string(), value.to_string()));
    }

    Ok(LaunchSpec {
        target,
        client_id: cli.client_id.clone(),
        vm_args: cli.vm_args.clone(),
        properties,
        heap: cli.heap.clone(),
        debug: cli.debug_agent,
        cwd: cli.workspace.clone(),
        env: Vec::new(),
    })
}

fn load_settings(cli: &Cli) -> anyhow::Result<Option<serde_json::Value>> {
    let Some(path) = &cli.settings else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    let settings = serde_json::from_str(&text)
        .with_context(|| format!("settings file {} is not valid JSON", path.display()))?;
    Ok(Some(settings))
}
