//! Binary entry point for the topogen CLI.

use std::env;
use std::io::{self, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use topogen::{
    ConfigError, EnvironmentStore, InitSummary, ManifestDiscoverer, MergePlan, MergeReport,
    PipelineError, ServiceSummary, SynthesisOrchestrator, TerminalConsole, TopogenConfig,
    TopologyCache,
};

mod cli;

use cli::{Cli, Command};

const LOG_ENV_VAR: &str = "TOPOGEN_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid project directory: {0}")]
    Project(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let root = project_root(cli.project.as_deref())?;
    let config = load_config(&cli)?;

    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());

    let pipeline = SynthesisOrchestrator::new(
        TopologyCache::new(ManifestDiscoverer::new()).with_cancellation(cancel),
        EnvironmentStore::new(&config.state_path(&root), &config.environment),
        TerminalConsole::new(config.no_prompt),
        config.scope(),
        config.service_name.clone(),
    )?;
    let manifest = config.manifest_path(&root);
    let stdout = io::stdout();

    match cli.command {
        Command::Init => {
            let summary = pipeline.init(&manifest, &root).await?;
            write_init(stdout.lock(), &summary);
        }
        Command::Render(args) => {
            let out = Utf8PathBuf::from(args.out);
            let report = pipeline.render(&manifest, &out).await?;
            write_render(stdout.lock(), &out, &report);
        }
        Command::Preview => {
            let plan = pipeline.preview(&manifest, &root).await?;
            write_plan(stdout.lock(), &plan);
        }
        Command::Services => {
            let services = pipeline.services(&manifest).await?;
            write_services(stdout.lock(), &services);
        }
    }
    Ok(())
}

fn project_root(project: Option<&str>) -> Result<Utf8PathBuf, CliError> {
    let cwd = env::current_dir().map_err(|err| CliError::Project(err.to_string()))?;
    let base = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|path| CliError::Project(format!("{} is not valid UTF-8", path.display())))?;
    Ok(project.map_or_else(|| base.clone(), |dir| base.join(dir)))
}

fn load_config(cli: &Cli) -> Result<TopogenConfig, CliError> {
    let mut config = TopogenConfig::load_without_cli_args()?;
    if let Some(environment) = &cli.environment {
        config.environment.clone_from(environment);
    }
    if let Some(location) = &cli.location {
        config.location.clone_from(location);
    }
    config.no_prompt |= cli.no_prompt;
    config.validate()?;
    Ok(config)
}

fn watch_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}

fn write_init(mut target: impl Write, summary: &InitSummary) {
    for path in &summary.merge.written {
        writeln!(target, "wrote {path}").ok();
    }
    for path in &summary.merge.kept {
        writeln!(target, "kept {path}").ok();
    }
    let exposed = if summary.exposure.exposed.is_empty() {
        String::from("none")
    } else {
        summary
            .exposure
            .exposed
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    };
    writeln!(
        target,
        "{} written, {} kept, {} unchanged; exposed services: {exposed}",
        summary.merge.written.len(),
        summary.merge.kept.len(),
        summary.merge.unchanged.len(),
    )
    .ok();
}

fn write_render(mut target: impl Write, out: &Utf8Path, report: &MergeReport) {
    writeln!(
        target,
        "rendered {} files into {out} ({} already up to date)",
        report.written.len(),
        report.unchanged.len()
    )
    .ok();
}

fn write_plan(mut target: impl Write, plan: &MergePlan) {
    for (path, status) in plan.iter() {
        writeln!(target, "{:<9} {path}", status.label()).ok();
    }
}

fn write_services(mut target: impl Write, services: &[ServiceSummary]) {
    for service in services {
        let binding = service
            .binding
            .as_ref()
            .map_or_else(|| String::from("-"), |(name, port)| format!("{name}:{port}"));
        let path = service.path.as_ref().map_or("-", |path| path.as_str());
        let exposure = if service.exposed { "external" } else { "internal" };
        writeln!(
            target,
            "{}\t{}\t{binding}\t{exposure}\t{path}",
            service.name, service.kind
        )
        .ok();
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(write: impl FnOnce(&mut Vec<u8>)) -> String {
        let mut buf = Vec::new();
        write(&mut buf);
        String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"))
    }

    #[test]
    fn write_error_writes_cli_error() {
        let err = CliError::Config(ConfigError::MissingField(String::from(
            "missing environment name",
        )));

        let rendered = render(|buf| write_error(buf, &err));

        assert!(
            rendered.contains("configuration error: missing configuration field"),
            "rendered: {rendered}"
        );
    }

    #[test]
    fn write_services_lists_binding_and_exposure() {
        let services = vec![
            ServiceSummary {
                name: String::from("web"),
                kind: "project",
                path: Some(Utf8PathBuf::from("src/Web/Web.csproj")),
                binding: Some((String::from("http"), 8080)),
                exposed: true,
            },
            ServiceSummary {
                name: String::from("worker"),
                kind: "project",
                path: None,
                binding: None,
                exposed: false,
            },
        ];

        let rendered = render(|buf| write_services(buf, &services));

        assert_eq!(
            rendered,
            "web\tproject\thttp:8080\texternal\tsrc/Web/Web.csproj\nworker\tproject\t-\tinternal\t-\n"
        );
    }

    #[test]
    fn project_root_joins_relative_directories() {
        let root = project_root(Some("demo")).unwrap_or_else(|err| panic!("root: {err}"));
        assert!(root.is_absolute());
        assert!(root.ends_with("demo"));
    }
}
