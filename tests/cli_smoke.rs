//! Behavioural smoke tests for the CLI entrypoint.

use std::fs;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use camino::Utf8PathBuf;
use predicates::prelude::*;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use topogen::test_support::SAMPLE_MANIFEST;

struct Project {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl Project {
    fn record_exposure(&self, names: &str) {
        let dir = self.root.join(".topogen/dev");
        fs::create_dir_all(&dir).unwrap_or_else(|err| panic!("create state dir: {err}"));
        fs::write(
            dir.join("config.toml"),
            format!("version = 1\n\n[services.app.config]\nexposedServices = [{names}]\n"),
        )
        .unwrap_or_else(|err| panic!("write environment config: {err}"));
    }
}

#[fixture]
fn project() -> Project {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("create project dir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("project dir is not UTF-8: {}", path.display()));
    fs::write(root.join("topology.json"), SAMPLE_MANIFEST)
        .unwrap_or_else(|err| panic!("write manifest: {err}"));
    Project { _tmp: tmp, root }
}

fn topogen(project: &Project) -> Command {
    let mut cmd = cargo_bin_cmd!("topogen");
    cmd.current_dir(&project.root)
        .env_remove("TOPOGEN_ENVIRONMENT")
        .env_remove("TOPOGEN_CONFIG_PATH")
        .env_remove("TOPOGEN_LOG");
    cmd
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("topogen");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("render"))
        .stdout(predicate::str::contains("preview"))
        .stdout(predicate::str::contains("services"));
}

#[rstest]
fn services_lists_bindings_and_paths(project: Project) {
    topogen(&project)
        .args(["services", "--environment", "dev", "--project", project.root.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "api\tproject\thttp:8081\tinternal\tsrc/Api/Api.csproj",
        ))
        .stdout(predicate::str::contains(
            "worker\tproject\t-\tinternal\tsrc/Worker/Worker.csproj",
        ));
}

#[rstest]
fn missing_environment_names_every_source(project: Project) {
    topogen(&project)
        .arg("services")
        .assert()
        .failure()
        .stderr(predicate::str::contains("TOPOGEN_ENVIRONMENT"))
        .stderr(predicate::str::contains("--environment"));
}

#[rstest]
fn init_without_prompts_fails_until_exposure_is_recorded(project: Project) {
    topogen(&project)
        .args(["init", "-e", "dev", "--no-prompt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("input required"));

    assert!(!project.root.join("infra").exists());
}

#[rstest]
fn init_uses_recorded_exposure(project: Project) {
    project.record_exposure(r#""web""#);

    topogen(&project)
        .args(["init", "-e", "dev", "--no-prompt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("exposed services: web"));

    let descriptor = fs::read_to_string(project.root.join("src/Web/manifests/containerApp.tmpl.yaml"))
        .unwrap_or_else(|err| panic!("read web descriptor: {err}"));
    assert!(descriptor.contains("external: true"), "descriptor: {descriptor}");
}

#[rstest]
fn render_writes_only_shared_infrastructure(project: Project) {
    let out = project.root.join("out");

    topogen(&project)
        .args(["render", "-e", "dev", "--out", out.as_str()])
        .assert()
        .success();

    assert!(out.join("infra/main.bicep").is_file());
    assert!(out.join("infra/resources.bicep").is_file());
    assert!(!out.join("src").exists());
}

#[rstest]
fn preview_reports_new_files(project: Project) {
    topogen(&project)
        .args(["preview", "-e", "dev"])
        .assert()
        .success()
        .stdout(predicate::str::contains("new"))
        .stdout(predicate::str::contains("infra/main.bicep"));

    assert!(!project.root.join("infra").exists());
}
