mod helpers;

use std::collections::BTreeMap;

use anyhow::anyhow;
use lyra::config::PlacementConfig;
use lyra::loader::{AttemptOutcome, ProgressiveLoader, ResourceExhausted};
use lyra::placement::{Device, DeviceMapMode, PlacementAssignment, PlacementError, Tier};

use helpers::{test_config, ScriptedLoad};

#[test]
fn exhausts_all_three_tiers_and_returns_last_error() {
    let mut config = test_config(32, Some(16));
    config
        .memory_budgets
        .insert(Device::Accelerator(0), "8GB".into());
    let loader = ProgressiveLoader::for_config(&config);
    let op = ScriptedLoad::always_oom();

    let run = loader.load_traced(&config, |a, c| op.call(a, c));

    let calls = op.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(run.attempts.len(), 3);

    // Tier 1: automatic with the configured budgets
    match &calls[0] {
        PlacementAssignment::Automatic { budgets } => {
            assert_eq!(budgets.get(&Device::Accelerator(0)).map(String::as_str), Some("8GB"));
        }
        other => panic!("expected automatic, got {other:?}"),
    }

    // Tier 2: layers 0..16 on the accelerator, the rest plus norm/head on host
    assert_eq!(calls[1].tier(), Tier::Partial);
    for i in 0..16 {
        assert_eq!(
            calls[1].device_for(&format!("model.layers.{i}")),
            Some(Device::Accelerator(0))
        );
    }
    for i in 16..32 {
        assert_eq!(calls[1].device_for(&format!("model.layers.{i}")), Some(Device::Host));
    }
    assert_eq!(calls[1].device_for("model.embed_tokens"), Some(Device::Accelerator(0)));
    assert_eq!(calls[1].device_for("model.norm"), Some(Device::Host));
    assert_eq!(calls[1].device_for("lm_head"), Some(Device::Host));
    assert!(calls[1].budgets().is_none());

    // Tier 3: everything on host
    assert!(calls[2].is_all_host());
    assert_eq!(calls[2].device_map().unwrap().len(), 35);

    // The returned failure is the last one, not the first
    let err = run.result.unwrap_err();
    assert!(format!("{err:#}").contains("attempt 3"));
    assert!(err.downcast_ref::<ResourceExhausted>().is_some());
    assert!(run
        .attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::RecoverableFailure));
}

#[test]
fn stops_at_first_success() {
    let config = test_config(32, Some(16));
    let loader = ProgressiveLoader::for_config(&config);
    let op = ScriptedLoad::succeed_on(2);

    let run = loader.load_traced(&config, |a, c| op.call(a, c));

    assert_eq!(run.result.unwrap(), "loaded on attempt 2");
    assert_eq!(op.calls().len(), 2);
    assert_eq!(run.attempts.len(), 2);
    assert_eq!(run.attempts[0].outcome, AttemptOutcome::RecoverableFailure);
    assert_eq!(run.attempts[1].outcome, AttemptOutcome::Success);
    assert_eq!(run.attempts[1].tier(), Tier::Partial);
    assert!(run.attempts[1].failure.is_none());
}

#[test]
fn first_attempt_success_is_a_single_attempt() {
    let config = PlacementConfig::default();
    let loader = ProgressiveLoader::for_config(&config);
    let op = ScriptedLoad::succeed_on(1);

    let value = loader.load(&config, |a, c| op.call(a, c)).unwrap();

    assert_eq!(value, "loaded on attempt 1");
    assert_eq!(op.calls().len(), 1);
}

#[test]
fn explicit_map_with_unbudgeted_device_fails_before_loading() {
    let mut map = BTreeMap::new();
    map.insert("model.embed_tokens".to_string(), Device::Accelerator(1));
    map.insert("lm_head".to_string(), Device::Host);
    let mut config = test_config(32, None);
    config.device_map_mode = DeviceMapMode::Explicit(map);
    config
        .memory_budgets
        .insert(Device::Accelerator(0), "8GB".into());

    let loader = ProgressiveLoader::for_config(&config);
    let op = ScriptedLoad::succeed_on(1);
    let run = loader.load_traced(&config, |a, c| op.call(a, c));

    assert!(op.calls().is_empty());
    assert!(run.attempts.is_empty());
    let err = run.result.unwrap_err();
    match err.downcast_ref::<PlacementError>() {
        Some(PlacementError::UnknownDevice { component, device }) => {
            assert_eq!(component, "model.embed_tokens");
            assert_eq!(*device, Device::Accelerator(1));
        }
        other => panic!("expected unknown device error, got {other:?}"),
    }
}

#[test]
fn explicit_map_degrades_through_partial_and_host_tiers() {
    let mut config = test_config(8, Some(3));
    let mut map = BTreeMap::new();
    map.insert("model.embed_tokens".to_string(), Device::Accelerator(1));
    for i in 0..8 {
        map.insert(format!("model.layers.{i}"), Device::Accelerator(1));
    }
    map.insert("model.norm".to_string(), Device::Accelerator(1));
    map.insert("lm_head".to_string(), Device::Host);
    config.device_map_mode = DeviceMapMode::Explicit(map.clone());
    config
        .memory_budgets
        .insert(Device::Accelerator(1), "12GB".into());

    let loader = ProgressiveLoader::for_config(&config);
    let op = ScriptedLoad::always_oom();
    let run = loader.load_traced(&config, |a, c| op.call(a, c));

    let calls = op.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0], PlacementAssignment::Explicit { map });
    assert_eq!(calls[0].tier(), Tier::Full);

    // The partial split uses the budgeted accelerator, not accelerator 0.
    match &calls[1] {
        PlacementAssignment::Partial {
            accelerator,
            accelerator_layers,
            ..
        } => {
            assert_eq!(*accelerator, Device::Accelerator(1));
            assert_eq!(*accelerator_layers, 3);
        }
        other => panic!("expected partial split, got {other:?}"),
    }
    assert_eq!(calls[1].device_for("model.layers.2"), Some(Device::Accelerator(1)));
    assert_eq!(calls[1].device_for("model.layers.3"), Some(Device::Host));
    assert_eq!(calls[1].device_for("model.embed_tokens"), Some(Device::Accelerator(1)));

    assert_eq!(calls[2].tier(), Tier::Host);
    assert!(calls[2].is_all_host());
    assert!(format!("{:#}", run.result.unwrap_err()).contains("attempt 3"));
}

#[test]
fn host_device_map_makes_a_single_host_attempt() {
    let mut config = test_config(8, None);
    config.device_map_mode = DeviceMapMode::Host;
    let loader = ProgressiveLoader::for_config(&config);
    let op = ScriptedLoad::always_oom();

    let run = loader.load_traced(&config, |a, c| op.call(a, c));

    let calls = op.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].is_all_host());
    assert_eq!(run.attempts[0].tier(), Tier::Host);
    assert!(run.result.is_err());
}

#[test]
fn disabled_fallback_makes_one_attempt() {
    let mut config = test_config(32, Some(16));
    config.progressive_fallback_enabled = false;
    let loader = ProgressiveLoader::for_config(&config);
    let op = ScriptedLoad::always_oom();

    let run = loader.load_traced(&config, |a, c| op.call(a, c));

    assert_eq!(op.calls().len(), 1);
    let err = run.result.unwrap_err();
    assert!(format!("{err:#}").contains("attempt 1"));
}

#[test]
fn fatal_failure_is_returned_unchanged() {
    let config = test_config(32, Some(16));
    let loader = ProgressiveLoader::for_config(&config);
    let mut calls = 0;

    let run = loader.load_traced(&config, |_, _| -> anyhow::Result<()> {
        calls += 1;
        Err(anyhow!("weights for test/model not found"))
    });

    assert_eq!(calls, 1);
    assert_eq!(run.attempts.len(), 1);
    assert_eq!(run.attempts[0].outcome, AttemptOutcome::FatalFailure);
    assert_eq!(
        run.result.unwrap_err().to_string(),
        "weights for test/model not found"
    );
}

#[test]
fn untyped_out_of_memory_message_is_recoverable() {
    let config = test_config(8, None);
    let loader = ProgressiveLoader::for_config(&config);
    let mut calls = 0;

    let result = loader.load(&config, |assignment, _| {
        calls += 1;
        if assignment.tier() == Tier::Full {
            Err(anyhow!("CUDA out of memory. Tried to allocate 20.00 MiB"))
        } else {
            Ok(assignment.tier())
        }
    });

    assert_eq!(result.unwrap(), Tier::Partial);
    assert_eq!(calls, 2);
}

#[test]
fn host_exhaustion_on_all_host_tier_is_fatal() {
    let config = test_config(4, Some(2));
    let loader = ProgressiveLoader::for_config(&config);

    let run = loader.load_traced(&config, |assignment, _| -> anyhow::Result<()> {
        let device = if assignment.is_all_host() {
            Device::Host
        } else {
            Device::Accelerator(0)
        };
        Err(ResourceExhausted::new(device, "no memory left").into())
    });

    assert_eq!(run.attempts.len(), 3);
    assert_eq!(run.attempts[2].outcome, AttemptOutcome::FatalFailure);
    let err = run.result.unwrap_err();
    assert_eq!(
        err.downcast_ref::<ResourceExhausted>().map(|e| e.device),
        Some(Device::Host)
    );
}

#[test]
fn attempts_serialize_with_assignment_kind() {
    let config = test_config(4, None);
    let loader = ProgressiveLoader::for_config(&config);
    let op = ScriptedLoad::succeed_on(2);

    let run = loader.load_traced(&config, |a, c| op.call(a, c));
    let json = serde_json::to_value(&run.attempts).unwrap();

    assert_eq!(json[0]["assignment"]["kind"], "automatic");
    assert_eq!(json[0]["tier"], "accelerator");
    assert_eq!(json[0]["tier"], run.attempts[0].tier().to_string());
    assert_eq!(json[1]["tier"], "partial");
    assert_eq!(json[1]["assignment"]["kind"], "partial");
    assert_eq!(json[1]["number"], 2);
}

#[tokio::test]
async fn async_loader_follows_the_same_tiers() {
    let config = test_config(32, Some(16));
    let loader = ProgressiveLoader::for_config(&config);
    let mut tiers = Vec::new();

    let run = loader
        .load_async_traced(&config, |assignment, _config| {
            tiers.push(assignment.tier());
            let attempt = tiers.len();
            async move {
                tokio::task::yield_now().await;
                if assignment.is_all_host() {
                    Ok(attempt)
                } else {
                    Err(helpers::accelerator_oom(attempt))
                }
            }
        })
        .await;

    assert_eq!(run.result.unwrap(), 3);
    assert_eq!(tiers, vec![Tier::Full, Tier::Partial, Tier::Host]);
}

#[tokio::test]
async fn async_load_returns_last_error() {
    let config = test_config(8, None);
    let loader = ProgressiveLoader::for_config(&config);
    let mut attempt = 0;

    let err = loader
        .load_async(&config, |_, _| {
            attempt += 1;
            let n = attempt;
            async move { Err::<(), _>(helpers::accelerator_oom(n)) }
        })
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("attempt 3"));
}
