//! BDD scenarios for exposure decisions.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ExposureContext, exposure_context};

#[scenario(
    path = "tests/features/exposure.feature",
    name = "Remember the first selection"
)]
fn scenario_remember_selection(exposure_context: ExposureContext) {
    let _ = exposure_context;
}

#[scenario(
    path = "tests/features/exposure.feature",
    name = "Ask only about services a stale decision left open"
)]
fn scenario_repair_stale_decision(exposure_context: ExposureContext) {
    let _ = exposure_context;
}

#[scenario(
    path = "tests/features/exposure.feature",
    name = "Fail without saving when nobody answers"
)]
fn scenario_fail_without_answer(exposure_context: ExposureContext) {
    let _ = exposure_context;
}
