use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use crate::fixtures::{Lifecycle, TestChild};
use crate::summoner::{CompareFn, SummonFn, Summoner};

fn counting_summoner(lifecycle: &Lifecycle) -> Summoner<serde_json::Value, TestChild> {
    let lifecycle = lifecycle.clone();
    let factory: SummonFn<serde_json::Value, TestChild> = Arc::new(move |_params| {
        let lifecycle = lifecycle.clone();
        Box::pin(async move { Ok(lifecycle.child()) })
    });
    Summoner::new(factory)
}

#[tokio::test]
async fn holds_at_most_one_child() -> Result<()> {
    let lifecycle = Lifecycle::default();
    let summoner = counting_summoner(&lifecycle);

    summoner.spawn(json!({ "stream": "s1" })).await?;
    assert!(summoner.is_alive().await);
    assert_eq!(lifecycle.spawned(), 1);

    // Equal params: no-op.
    summoner.spawn(json!({ "stream": "s1" })).await?;
    assert_eq!(lifecycle.spawned(), 1, "expected equal params to leave the child alone");

    // Changed params: destroy then create.
    summoner.spawn(json!({ "stream": "s2" })).await?;
    assert_eq!(lifecycle.spawned(), 2);
    assert_eq!(lifecycle.destroyed(), 1);
    assert_eq!(lifecycle.live(), 1, "expected at most one live child");
    Ok(())
}

#[tokio::test]
async fn kill_empties_the_slot() -> Result<()> {
    let lifecycle = Lifecycle::default();
    let summoner = counting_summoner(&lifecycle);

    summoner.kill().await?;
    assert_eq!(lifecycle.destroyed(), 0, "expected killing an empty slot to be a no-op");

    summoner.spawn(json!(1)).await?;
    summoner.kill().await?;
    assert!(!summoner.is_alive().await);
    assert_eq!(lifecycle.destroyed(), 1);

    // A spawn after a kill recreates even for equal params.
    summoner.spawn(json!(1)).await?;
    assert_eq!(lifecycle.spawned(), 2);
    Ok(())
}

#[tokio::test]
async fn custom_compare_overrides_hash_equality() -> Result<()> {
    let lifecycle = Lifecycle::default();
    let factory: SummonFn<serde_json::Value, TestChild> = {
        let lifecycle = lifecycle.clone();
        Arc::new(move |_params| {
            let lifecycle = lifecycle.clone();
            Box::pin(async move { Ok(lifecycle.child()) })
        })
    };
    let compare: CompareFn<serde_json::Value> = Arc::new(|_current, _next| true);
    let summoner = Summoner::with_compare(factory, compare);

    summoner.spawn(json!(1)).await?;
    summoner.spawn(json!(2)).await?;
    assert_eq!(lifecycle.spawned(), 1, "expected the always-equal compare to suppress the respawn");
    Ok(())
}

#[tokio::test]
async fn destroy_tears_down_the_child() -> Result<()> {
    let lifecycle = Lifecycle::default();
    let summoner = counting_summoner(&lifecycle);
    summoner.spawn(json!(1)).await?;
    summoner.destroy().await?;
    assert_eq!(lifecycle.live(), 0);
    Ok(())
}
