//! BDD step definitions for exposure decisions.

use std::fs;

use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use topogen::exposure::PersistedDecisions;
use topogen::test_support::ScriptedConsole;
use topogen::{
    DecisionStore, DeploymentScope, ManifestDiscoverer, SynthesisOrchestrator, TopologyCache,
};

use super::test_helpers::{
    ENVIRONMENT, ExposureContext, InitOutcome, InitRun, SERVICE, names, write_sample_manifest,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a project with the sample topology")]
fn sample_project(exposure_context: ExposureContext) -> ExposureContext {
    write_sample_manifest(&exposure_context);
    exposure_context
}

#[given("the environment already exposes \"{list}\"")]
fn persisted_exposure(exposure_context: ExposureContext, list: String) -> ExposureContext {
    exposure_context
        .store()
        .save(SERVICE, &names(&list))
        .unwrap_or_else(|err| panic!("seed persisted decisions: {err}"));
    exposure_context
}

#[given("the user will select \"{list}\"")]
fn queued_selection(mut exposure_context: ExposureContext, list: String) -> ExposureContext {
    exposure_context
        .answers
        .push(names(&list).into_iter().collect());
    exposure_context
}

#[when("I initialise the project")]
fn initialise(exposure_context: ExposureContext) -> Result<ExposureContext, StepError> {
    run_init(exposure_context)
}

#[when("I rerun the initialisation")]
fn initialise_again(exposure_context: ExposureContext) -> Result<ExposureContext, StepError> {
    run_init(exposure_context)
}

fn run_init(mut exposure_context: ExposureContext) -> Result<ExposureContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let console = ScriptedConsole::new();
    for answer in exposure_context.answers.drain(..) {
        console.push_selection(answer);
    }
    let orchestrator = SynthesisOrchestrator::new(
        TopologyCache::new(ManifestDiscoverer::new()),
        exposure_context.store(),
        console,
        DeploymentScope::new(ENVIRONMENT, "eastus"),
        SERVICE,
    )
    .map_err(|err| StepError::Assertion(err.to_string()))?;

    let manifest = exposure_context.manifest();
    let root = exposure_context.root.clone();
    let outcome = match runtime.block_on(async { orchestrator.init(&manifest, &root).await }) {
        Ok(summary) => InitOutcome::Succeeded(summary),
        Err(err) => InitOutcome::Failed(err.to_string()),
    };
    exposure_context.runs.push(InitRun {
        prompts: orchestrator.console().selection_prompts(),
        outcome,
    });
    Ok(exposure_context)
}

fn run_at(exposure_context: &ExposureContext, first: bool) -> Result<&InitRun, StepError> {
    let run = if first {
        exposure_context.runs.first()
    } else {
        exposure_context.runs.last()
    };
    run.ok_or_else(|| StepError::Assertion(String::from("no init run recorded")))
}

#[then("the first run prompted with \"{list}\"")]
fn first_run_prompted(exposure_context: &ExposureContext, list: String) -> Result<(), StepError> {
    let run = run_at(exposure_context, true)?;
    let expected: Vec<String> = names(&list).into_iter().collect();
    if run.prompts == vec![expected.clone()] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one prompt offering {expected:?}, got {:?}",
            run.prompts
        )))
    }
}

#[then("the latest run asked no questions")]
fn latest_run_silent(exposure_context: &ExposureContext) -> Result<(), StepError> {
    let run = run_at(exposure_context, false)?;
    if exposure_context.runs.len() < 2 {
        return Err(StepError::Assertion(String::from("expected a second run")));
    }
    match &run.outcome {
        InitOutcome::Succeeded(_) if run.prompts.is_empty() => Ok(()),
        InitOutcome::Succeeded(_) => Err(StepError::Assertion(format!(
            "expected no prompts, got {:?}",
            run.prompts
        ))),
        InitOutcome::Failed(message) => Err(StepError::Assertion(format!(
            "expected success, got failure: {message}"
        ))),
    }
}

#[then("the saved exposure is \"{list}\"")]
fn saved_exposure(exposure_context: &ExposureContext, list: String) -> Result<(), StepError> {
    let loaded = exposure_context
        .store()
        .load(SERVICE)
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let expected = PersistedDecisions::from_names(names(&list));
    if loaded == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected:?}, found {loaded:?}"
        )))
    }
}

#[then("the generated file \"{path}\" contains \"{text}\"")]
fn generated_file_contains(
    exposure_context: &ExposureContext,
    path: String,
    text: String,
) -> Result<(), StepError> {
    let contents = fs::read_to_string(exposure_context.root.join(&path))
        .map_err(|err| StepError::Assertion(format!("read {path}: {err}")))?;
    if contents.contains(&text) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "{path} does not contain {text:?}:\n{contents}"
        )))
    }
}

#[then("the latest run failed mentioning \"{text}\"")]
fn latest_run_failed(exposure_context: &ExposureContext, text: String) -> Result<(), StepError> {
    match &run_at(exposure_context, false)?.outcome {
        InitOutcome::Failed(message) if message.contains(&text) => Ok(()),
        InitOutcome::Failed(message) => Err(StepError::Assertion(format!(
            "expected failure mentioning {text:?}, got: {message}"
        ))),
        InitOutcome::Succeeded(summary) => Err(StepError::Assertion(format!(
            "expected failure, got success: {summary:?}"
        ))),
    }
}

#[then("no exposure decision is saved")]
fn nothing_saved(exposure_context: &ExposureContext) -> Result<(), StepError> {
    let loaded = exposure_context
        .store()
        .load(SERVICE)
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if loaded == PersistedDecisions::Absent {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected nothing persisted, found {loaded:?}"
        )))
    }
}
