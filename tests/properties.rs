//! Cross-cutting guarantees of the scheduler, exercised end to end.

#[cfg(feature = "metrics")]
use mark_flaky_tests::flaky;
use runahead::testing::*;
use runahead::{MapStep, Outcome, Run, RunOptions};
use std::collections::HashMap;
#[cfg(feature = "metrics")]
use std::time::Duration;

fn keyed_inputs(n: usize) -> HashMap<String, String> {
    (0..n)
        .map(|i| (format!("k{i}"), format!("value {i} of chunky bacon")))
        .collect()
}

/// A pipeline used for the determinism sweep: a rewrite, a key-dependent
/// edit, and a glob deletion.
fn build_run(options: RunOptions) -> anyhow::Result<Run<String, String>> {
    let mut run = Run::with_options(options);
    run.add_step(rewrite_step("chunky", "smoky"))?;
    run.add_step(MapStep::new(|k: &String, v: &String| {
        Ok(if k.ends_with('3') {
            Outcome::Value(format!("{v} (third)"))
        } else {
            Outcome::Unchanged
        })
    }))?;
    run.add_step(delete_matching_step("k1*")?)?;
    Ok(run)
}

#[test]
fn final_map_is_independent_of_scheduling_knobs() -> anyhow::Result<()> {
    let inputs = keyed_inputs(30);
    let mut baseline: Option<HashMap<String, String>> = None;

    for worker_count in [1usize, 2, 4] {
        for batch_cap in [1usize, 3, 16] {
            let run = build_run(RunOptions {
                worker_count: Some(worker_count),
                batch_cap,
                ..RunOptions::default()
            })?;
            let out = run.run_to_completion(inputs.clone())?;
            let values = out.values();
            match &baseline {
                None => baseline = Some(values),
                Some(expected) => assert_eq!(
                    &values, expected,
                    "differs at worker_count={worker_count} batch_cap={batch_cap}"
                ),
            }
        }
    }
    Ok(())
}

#[test]
fn identity_pipeline_of_any_length_is_a_round_trip() -> anyhow::Result<()> {
    let inputs: HashMap<String, i64> = (0..20).map(|i| (format!("k{i}"), i)).collect();

    let mut run: Run<String, i64> = Run::new();
    for _ in 0..4 {
        run.add_step(identity_step())?;
    }
    let out = run.run_to_completion(inputs.clone())?;

    assert_final_values_equal(&out, inputs);
    assert_gens(&out, &"k0".to_string(), &[0, 0, 0, 0]);
    assert_gens(&out, &"k19".to_string(), &[0, 0, 0, 0]);
    Ok(())
}

#[cfg(feature = "metrics")]
#[test]
fn transforms_returning_equal_values_emit_nothing() -> anyhow::Result<()> {
    let mut run: Run<String, String> = Run::new();
    // returns a fresh but equal value, which is still "unchanged"
    run.add_step(MapStep::new(|_k: &String, v: &String| {
        Ok(Outcome::Value(v.clone()))
    }))?;
    run.add_step(identity_step())?;

    let inputs = keyed_inputs(10);
    let out = run.run_to_completion(inputs.clone())?;

    assert_final_values_equal(&out, inputs);
    assert_eq!(out.metrics().emitted(), 0);
    assert!(out.metrics().unchanged_suppressed() >= 1);
    Ok(())
}

#[test]
fn failed_keys_behave_as_if_the_stage_were_omitted() -> anyhow::Result<()> {
    // Singleton batches so the failure is contained to exactly one key.
    let mut run: Run<String, String> = Run::with_options(RunOptions {
        batch_cap: 1,
        ..RunOptions::default()
    });
    run.add_step(MapStep::new(|_k: &String, v: &String| {
        Ok(Outcome::Value(format!("{v}a")))
    }))?;
    run.add_step(MapStep::new(|k: &String, v: &String| {
        if k == "k" {
            anyhow::bail!("rejecting {k}");
        }
        Ok(Outcome::Value(format!("{v}b")))
    }))?;
    run.add_step(MapStep::new(|_k: &String, v: &String| {
        Ok(Outcome::Value(format!("{v}c")))
    }))?;

    let out = run.run_to_completion(HashMap::from([
        ("k".to_string(), "v".to_string()),
        ("m".to_string(), "v".to_string()),
    ]))?;

    assert_final_values_equal(
        &out,
        [
            ("k".to_string(), "vac".to_string()),
            ("m".to_string(), "vabc".to_string()),
        ],
    );
    Ok(())
}

#[test]
fn large_mixed_pipeline_terminates() -> anyhow::Result<()> {
    let inputs: HashMap<String, String> =
        (0..100).map(|i| (format!("k{i}"), format!("v{i}"))).collect();

    let mut run: Run<String, String> = Run::with_options(RunOptions {
        batch_cap: 4,
        ..RunOptions::default()
    });
    run.add_step(rewrite_step("v", "w"))?;
    run.add_step(MapStep::new(|k: &String, v: &String| {
        if k.ends_with('7') {
            anyhow::bail!("sevens are unlucky");
        }
        Ok(Outcome::Value(format!("{v}+")))
    }))?;
    run.add_step(delete_matching_step("k9*")?)?;
    run.add_step(MapStep::new(|_k: &String, v: &String| {
        Ok(Outcome::Value(format!("[{v}]")))
    }))?;

    let out = run.run_to_completion(inputs)?;
    // k9 and k90..k99 are gone; everything else survived all four stages
    assert_eq!(out.len(), 89);
    assert!(!out.cancelled());
    Ok(())
}

/// Timing-dependent: asserts that speculation actually happened (stage 1
/// ran on the stale value before stage 0 finished) and was then corrected.
#[cfg(feature = "metrics")]
#[flaky]
#[test]
fn speculative_work_runs_early_and_is_superseded() {
    let mut run: Run<String, String> = Run::with_options(RunOptions {
        worker_count: Some(4),
        ..RunOptions::default()
    });
    run.add_step(MapStep::new(|_k: &String, v: &String| {
        std::thread::sleep(Duration::from_millis(100));
        Ok(Outcome::Value(v.to_uppercase()))
    }))
    .unwrap();
    run.add_step(MapStep::new(|_k: &String, v: &String| {
        Ok(Outcome::Value(format!("{v}!")))
    }))
    .unwrap();

    let out = run
        .run_to_completion(HashMap::from([("k".to_string(), "a".to_string())]))
        .unwrap();

    assert_final_values_equal(&out, [("k".to_string(), "A!".to_string())]);
    // stage 1 emitted both the speculative "a!" and the final "A!"
    assert!(
        out.metrics().emitted() >= 3,
        "expected a speculative emission before the corrected one"
    );
}
