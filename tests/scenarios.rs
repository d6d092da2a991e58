//! End-to-end pipeline behaviors, one test per scenario.

use runahead::testing::*;
use runahead::{MapStep, Outcome, Run};
use std::collections::HashMap;
use std::time::Duration;

fn string_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn pass_through_pipeline_returns_inputs_with_zero_gens() -> anyhow::Result<()> {
    let mut run: Run<String, i64> = Run::new();
    run.add_step(identity_step())?;
    run.add_step(identity_step())?;
    run.add_step(identity_step())?;

    let out = run.run_to_completion(HashMap::from([
        ("a".to_string(), 1),
        ("b".to_string(), 2),
    ]))?;

    assert_final_values_equal(&out, [("a".to_string(), 1), ("b".to_string(), 2)]);
    assert_gens(&out, &"a".to_string(), &[0, 0, 0]);
    assert_gens(&out, &"b".to_string(), &[0, 0, 0]);
    Ok(())
}

#[test]
fn non_conflicting_edits_compose_in_stage_order() -> anyhow::Result<()> {
    let mut run: Run<String, String> = Run::new();
    run.add_step(rewrite_step("chunky", "CHUNKY"))?;
    run.add_step(rewrite_step("bacon", "BACON"))?;

    let out = run.run_to_completion(string_map(&[("f", "chunky bacon")]))?;

    assert_final_values_equal(&out, string_map(&[("f", "CHUNKY BACON")]));
    let gens = out.get(&"f".to_string()).unwrap().gens();
    assert!(gens.slot(0) >= 1, "first stage must have stamped its slot");
    assert!(gens.slot(1) >= 1, "second stage must have stamped its slot");
    Ok(())
}

#[test]
fn stage_without_work_leaves_its_slot_at_zero() -> anyhow::Result<()> {
    let mut run: Run<String, String> = Run::new();
    run.add_step(rewrite_step("bacon", "BACON"))?;
    run.add_step(rewrite_step("chunky", "CHUNKY"))?;

    let out = run.run_to_completion(string_map(&[("f", "crispy bacon")]))?;

    assert_final_values_equal(&out, string_map(&[("f", "crispy BACON")]));
    let gens = out.get(&"f".to_string()).unwrap().gens();
    assert!(gens.slot(0) >= 1);
    assert_eq!(gens.slot(1), 0, "a stage that never emits never stamps");
    Ok(())
}

#[test]
fn speculative_output_is_discarded_when_upstream_changes() -> anyhow::Result<()> {
    let mut run: Run<String, String> = Run::new();
    run.add_step(MapStep::new(|_k: &String, v: &String| {
        std::thread::sleep(Duration::from_millis(80));
        Ok(if v == "a" {
            Outcome::Value("A".to_string())
        } else {
            Outcome::Unchanged
        })
    }))?;
    run.add_step(identity_step())?;

    let out = run.run_to_completion(string_map(&[("a", "a")]))?;

    // However early stage 1 ran on "a", the final value derives from the
    // dominating upstream change.
    assert_final_values_equal(&out, string_map(&[("a", "A")]));
    assert!(out.get(&"a".to_string()).unwrap().gens().slot(0) >= 1);
    Ok(())
}

#[test]
fn failing_stage_is_skipped_and_the_rest_still_run() -> anyhow::Result<()> {
    let mut run: Run<String, String> = Run::new();
    run.add_step(MapStep::new(|k: &String, v: &String| {
        if k == "x" {
            anyhow::bail!("no service for {k}");
        }
        Ok(Outcome::Value(format!("{v}?")))
    }))?;
    run.add_step(MapStep::new(|_k: &String, v: &String| {
        Ok(Outcome::Value(format!("{v}!")))
    }))?;

    let out = run.run_to_completion(string_map(&[("x", "hi"), ("y", "hi")]))?;

    // "x" and "y" were seeded into one batch, so the failure skips stage 0
    // for both; stage 1 still sees the original values.
    assert_final_values_equal(&out, string_map(&[("x", "hi!"), ("y", "hi!")]));
    Ok(())
}

#[test]
fn deletion_removes_matching_keys_from_the_result() -> anyhow::Result<()> {
    let mut run: Run<String, i64> = Run::new();
    run.add_step(delete_matching_step("tmp_*")?)?;

    let out = run.run_to_completion(HashMap::from([
        ("a".to_string(), 1),
        ("tmp_b".to_string(), 2),
    ]))?;

    assert_final_values_equal(&out, [("a".to_string(), 1)]);
    assert!(out.get(&"tmp_b".to_string()).is_none());
    Ok(())
}
